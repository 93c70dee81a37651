use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wallet address on the permanent-storage network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of one credit balance row: a user identity paired with the wallet
/// it connected. The same user with two wallets owns two balances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    pub user: UserId,
    pub wallet: WalletAddress,
}

impl AccountKey {
    pub fn new(user: UserId, wallet: WalletAddress) -> Self {
        Self { user, wallet }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_keys_distinguish_wallets() {
        let a = AccountKey::new(UserId::new("alice"), WalletAddress::new("wallet-1"));
        let b = AccountKey::new(UserId::new("alice"), WalletAddress::new("wallet-2"));
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "alice/wallet-1");
    }
}
