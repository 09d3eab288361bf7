pub mod database_ops;
pub mod orchestrator;
pub mod telemetry;

pub mod util {
    pub mod env;
    pub mod memory;
}
