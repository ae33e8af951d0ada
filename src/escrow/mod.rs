pub mod models;
pub mod protocol;
pub mod repository;

pub use models::{DisputeVote, Escrow, EscrowStatus, MultiSigApproval, VoteOutcome};
pub use protocol::{Actor, ConfirmOutcome, CreateEscrowParams, EscrowProtocol};
pub use repository::EscrowRepository;
