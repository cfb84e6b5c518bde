//! Magic-amount wallet linking
//!
//! An otherwise-anonymous deposit is claimed by asking the user to send a
//! unique micro-amount: the exact amount identifies the link request, and
//! the sending wallet becomes theirs. One wallet binds to at most one user.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use conjure_types::{LinkRequestId, UserId, WalletAddress};

/// State of a link request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Pending,
    Completed,
    Expired,
}

/// One outstanding magic-amount request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequest {
    pub id: LinkRequestId,
    pub user: UserId,
    pub asset: String,
    /// Exact raw amount the user must deposit
    pub magic_amount: String,
    pub state: LinkState,
    /// Wallet resolved on completion
    pub wallet: Option<WalletAddress>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct LinkerState {
    requests: HashMap<LinkRequestId, LinkRequest>,
    /// magic amount (asset, raw) → request
    by_amount: HashMap<(String, String), LinkRequestId>,
    /// wallet → owning user (one user per wallet)
    links: HashMap<WalletAddress, UserId>,
    next_nonce: u64,
}

/// Wallet ↔ user resolution service
#[derive(Clone)]
pub struct WalletLinker {
    state: Arc<RwLock<LinkerState>>,
    ttl: Duration,
    /// Base raw amount magic nonces are added to (e.g. 1_000_000 = 1 USDC)
    base_amount: u64,
}

impl WalletLinker {
    pub fn new(ttl: Duration, base_amount: u64) -> Self {
        Self {
            state: Arc::new(RwLock::new(LinkerState {
                requests: HashMap::new(),
                by_amount: HashMap::new(),
                links: HashMap::new(),
                next_nonce: 1,
            })),
            ttl,
            base_amount,
        }
    }

    /// Start a linking flow: the user must deposit exactly `magic_amount`
    /// of `asset` from the wallet they want linked.
    pub async fn initiate(&self, user: UserId, asset: impl Into<String>) -> LinkRequest {
        let asset = asset.into();
        let mut state = self.state.write().await;
        let nonce = state.next_nonce;
        state.next_nonce += 1;

        let request = LinkRequest {
            id: LinkRequestId::new(),
            user,
            asset: asset.clone(),
            magic_amount: (self.base_amount + nonce).to_string(),
            state: LinkState::Pending,
            wallet: None,
            created_at: Utc::now(),
            expires_at: Utc::now() + self.ttl,
        };
        state
            .by_amount
            .insert((asset, request.magic_amount.clone()), request.id.clone());
        state.requests.insert(request.id.clone(), request.clone());
        request
    }

    pub async fn status(&self, id: &LinkRequestId) -> Option<LinkRequest> {
        self.state.read().await.requests.get(id).cloned()
    }

    /// Known owner of a wallet, if linked.
    pub async fn owner_of(&self, wallet: &WalletAddress) -> Option<UserId> {
        self.state.read().await.links.get(wallet).cloned()
    }

    /// Bind a wallet to a user directly (verified external identity).
    /// Returns false if the wallet is already bound to a different user.
    pub async fn bind(&self, wallet: WalletAddress, user: UserId) -> bool {
        let mut state = self.state.write().await;
        match state.links.get(&wallet) {
            Some(existing) => existing == &user,
            None => {
                state.links.insert(wallet, user);
                true
            }
        }
    }

    /// Try to claim a deposit as a magic-amount link: on an exact match of
    /// (asset, raw amount) against a pending request, the sending wallet is
    /// bound to the requesting user and the request completes.
    pub async fn match_deposit(
        &self,
        asset: &str,
        raw_amount: &str,
        wallet: &WalletAddress,
    ) -> Option<UserId> {
        let mut state = self.state.write().await;
        let request_id = state
            .by_amount
            .get(&(asset.to_string(), raw_amount.to_string()))
            .cloned()?;

        let request = state.requests.get(&request_id)?.clone();
        if request.state != LinkState::Pending || request.expires_at <= Utc::now() {
            return None;
        }
        // The wallet may already belong to someone else
        if let Some(existing) = state.links.get(wallet) {
            if existing != &request.user {
                return None;
            }
        }

        let user = request.user.clone();
        state.links.insert(wallet.clone(), user.clone());
        state
            .by_amount
            .remove(&(request.asset.clone(), request.magic_amount.clone()));
        if let Some(r) = state.requests.get_mut(&request_id) {
            r.state = LinkState::Completed;
            r.wallet = Some(wallet.clone());
        }
        Some(user)
    }

    /// Expire pending requests past their deadline. Returns how many.
    pub async fn expire_stale(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let stale: Vec<LinkRequest> = state
            .requests
            .values()
            .filter(|r| r.state == LinkState::Pending && r.expires_at <= now)
            .cloned()
            .collect();
        for request in &stale {
            state
                .by_amount
                .remove(&(request.asset.clone(), request.magic_amount.clone()));
            if let Some(r) = state.requests.get_mut(&request.id) {
                r.state = LinkState::Expired;
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linker() -> WalletLinker {
        WalletLinker::new(Duration::minutes(30), 1_000_000)
    }

    #[tokio::test]
    async fn test_magic_amounts_are_unique() {
        let linker = linker();
        let a = linker.initiate(UserId::new(), "USDC").await;
        let b = linker.initiate(UserId::new(), "USDC").await;
        assert_ne!(a.magic_amount, b.magic_amount);
    }

    #[tokio::test]
    async fn test_match_binds_wallet_and_completes() {
        let linker = linker();
        let user = UserId::new();
        let request = linker.initiate(user.clone(), "USDC").await;
        let wallet = WalletAddress::new("0xabc");

        let matched = linker
            .match_deposit("USDC", &request.magic_amount, &wallet)
            .await;
        assert_eq!(matched, Some(user.clone()));
        assert_eq!(linker.owner_of(&wallet).await, Some(user));

        let status = linker.status(&request.id).await.unwrap();
        assert_eq!(status.state, LinkState::Completed);
        assert_eq!(status.wallet, Some(wallet.clone()));

        // The same amount cannot be claimed twice
        assert!(linker
            .match_deposit("USDC", &request.magic_amount, &wallet)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_wrong_amount_or_asset_does_not_match() {
        let linker = linker();
        let request = linker.initiate(UserId::new(), "USDC").await;
        let wallet = WalletAddress::new("0xabc");
        assert!(linker
            .match_deposit("USDC", "999", &wallet)
            .await
            .is_none());
        assert!(linker
            .match_deposit("ETH", &request.magic_amount, &wallet)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_wallet_binds_to_one_user() {
        let linker = linker();
        let alice = UserId::new();
        let bob = UserId::new();
        let wallet = WalletAddress::new("0xshared");

        assert!(linker.bind(wallet.clone(), alice.clone()).await);
        assert!(linker.bind(wallet.clone(), alice.clone()).await);
        assert!(!linker.bind(wallet.clone(), bob.clone()).await);

        // A magic-amount match against a wallet owned by someone else fails
        let request = linker.initiate(bob, "USDC").await;
        assert!(linker
            .match_deposit("USDC", &request.magic_amount, &wallet)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let linker = WalletLinker::new(Duration::zero(), 1_000_000);
        let request = linker.initiate(UserId::new(), "USDC").await;
        assert_eq!(linker.expire_stale().await, 1);
        let status = linker.status(&request.id).await.unwrap();
        assert_eq!(status.state, LinkState::Expired);
        assert!(linker
            .match_deposit("USDC", &request.magic_amount, &WalletAddress::new("0x1"))
            .await
            .is_none());
    }
}
