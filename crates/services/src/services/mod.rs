pub mod cancellation;
pub mod engine;
pub mod events;
pub mod executor;
pub mod gate;
pub mod kanban;
pub mod stage_bus;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
