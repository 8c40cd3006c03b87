pub mod registry;

pub use registry::TableRegistry;
