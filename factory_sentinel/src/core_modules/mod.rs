pub mod backend_selector;
pub mod channels;
pub mod classifier;
pub mod dispatcher;
pub mod frame_source;
pub mod state_store;
pub mod utils;
pub mod verdict;
