pub mod batching;
pub mod dispatcher;
pub mod resolver;
pub mod store;
