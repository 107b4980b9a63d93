pub mod linear_gaussian;
pub mod logistic;
pub mod multiclass;

pub use linear_gaussian::LinearGaussianModel;
pub use logistic::LogisticRegressionModel;
pub use multiclass::MulticlassLogisticRegressionModel;
