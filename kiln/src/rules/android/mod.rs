//! Android rule kinds and the graph enhancement that assembles an APK:
//! packageable aggregation, build-config generation, resource processing,
//! per-library pre-dexing, dex splitting and the binary pipeline itself.

pub mod binary;
pub mod build_config;
pub mod packageable;
pub mod pre_dex;
pub mod resource;
pub mod smart_dex;
pub mod split_dex;

pub use self::binary::AndroidBinaryDescription;
pub use self::build_config::AndroidBuildConfigDescription;
pub use self::packageable::{AndroidPackageableCollection, AndroidPackageableCollector};
pub use self::resource::AndroidResourceDescription;
