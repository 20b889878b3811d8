mod m0001_pipeline;
mod m0002_service_status;

use cetane::prelude::MigrationRegistry;

pub fn registry() -> MigrationRegistry {
    let mut reg = MigrationRegistry::new();
    reg.register(m0001_pipeline::migration());
    reg.register(m0002_service_status::migration());
    reg
}
