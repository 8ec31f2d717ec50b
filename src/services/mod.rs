pub mod conversation_service;
pub mod flush_worker;
pub mod message_service;
pub mod relations;
pub mod sequencer;
pub mod visibility;
