pub mod ensemble;
pub mod forest;
pub mod gbdt;
pub mod traits;

pub use self::ensemble::{Ensemble, Member};
pub use self::forest::RandomForestModel;
pub use self::gbdt::GBDTModel;
pub use self::traits::{FeatureMatrix, Model, ModelFactory};
