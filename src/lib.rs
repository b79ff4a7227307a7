pub mod blacklist;
pub mod cost;
pub mod dispatcher;
pub mod function;
pub mod graph;
pub mod plan;
pub mod settings;
pub mod stats;
pub mod value;
pub mod view;

pub mod functions {
    pub mod fault_injector;
    pub mod summing;
}
