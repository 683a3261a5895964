pub mod messages;
pub mod models;

pub use messages::handle_messages;
pub use models::handle_list_models;
