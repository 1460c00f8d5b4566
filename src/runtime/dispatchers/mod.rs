//! Dispatcher loops for [`Runtime`](crate::runtime::Runtime), one per queue:
//! - `orchestration`: replays instances over their delivered batches
//! - `worker`: executes activities and routes their completions back
//! - `timer`: converts durable timer schedules into delayed fired messages

mod orchestration;
mod timer;
mod worker;
