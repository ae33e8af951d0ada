pub mod manager;
pub mod models;

pub use manager::{NewSaga, SagaManager, SagaUpdate};
pub use models::{steps, OperationType, Saga, SagaState};
