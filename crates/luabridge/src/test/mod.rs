// Test module organization
pub mod test_args;
pub mod test_governor;
pub mod test_lua53;
pub mod test_machine;
pub mod test_objects;
pub mod test_registry;
