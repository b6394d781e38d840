//! Repository traits over the relational store, plus their `tokio_postgres`
//! implementations. Engine/window/alert-manager/purge code depends only on
//! the traits, so tests substitute `mockall` mocks for a live database
//! (§4.15).

pub mod annotation;
pub mod api_key;
pub mod broker;
pub mod characteristic;
pub mod data_source;
pub mod hierarchy;
pub mod retention;
pub mod sample;
pub mod violation;
pub mod window;

pub use annotation::{AnnotationRepository, PgAnnotationRepository};
pub use api_key::{ApiKeyRepository, PgApiKeyRepository};
pub use broker::{BrokerRepository, OpcUaServerRepository, PgBrokerRepository, PgOpcUaServerRepository};
pub use characteristic::{CharacteristicRepository, PgCharacteristicRepository};
pub use data_source::{DataSourceRepository, PgDataSourceRepository};
pub use hierarchy::{HierarchyRepository, PgHierarchyRepository};
pub use retention::{PgRetentionRepository, RetentionRepository};
pub use sample::{PgSampleRepository, SampleRepository, SubgroupStats};
pub use violation::{PgViolationRepository, ViolationRepository, ViolationStats};
pub use window::PgWindowRepository;
