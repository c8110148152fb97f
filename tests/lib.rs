//! Shared fixtures for the Overturn integration tests

pub mod fixtures {
    pub mod two_node;
}
