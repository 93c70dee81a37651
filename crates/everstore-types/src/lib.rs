pub mod account;
pub mod amount;
pub mod id;

pub use account::{AccountKey, UserId, WalletAddress};
pub use amount::{StorageAmount, UsdAmount, KB_PER_GB, KB_PER_MB, MICRO_PER_USD};
pub use id::RecordId;
