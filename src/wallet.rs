// Wallet Management Module - custodial Solana keys
use chrono::Utc;
use magic_crypt::MagicCryptTrait;
use rust_decimal::Decimal;
use solana_sdk::signature::{Keypair, Signer};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::ledger::LedgerStore;
use crate::models::Wallet;

// ==================== ENCRYPTION ====================

/// Seals signing keys at rest. Only the trade path ever opens them.
pub trait KeyVault: Send + Sync {
    fn seal(&self, keypair: &Keypair) -> Result<String>;
    fn open(&self, sealed: &str) -> Result<Keypair>;
}

/// AES-256 under the process master key (`MASTER_ENCRYPTION_KEY`).
pub struct MasterKeyVault {
    master_key: String,
}

impl MasterKeyVault {
    pub fn new(master_key: impl Into<String>) -> Result<Self> {
        let master_key = master_key.into();
        if master_key.len() < 16 {
            return Err(EngineError::Config(
                "MASTER_ENCRYPTION_KEY must be at least 16 characters".to_string(),
            ));
        }
        Ok(Self { master_key })
    }
}

impl KeyVault for MasterKeyVault {
    fn seal(&self, keypair: &Keypair) -> Result<String> {
        let mc = magic_crypt::new_magic_crypt!(&self.master_key, 256);
        let encoded = bs58::encode(keypair.to_bytes()).into_string();
        Ok(mc.encrypt_str_to_base64(encoded))
    }

    fn open(&self, sealed: &str) -> Result<Keypair> {
        let mc = magic_crypt::new_magic_crypt!(&self.master_key, 256);
        let encoded = mc
            .decrypt_base64_to_string(sealed)
            .map_err(|e| EngineError::KeyVault(format!("decryption failed: {}", e)))?;
        keypair_from_base58(&encoded)
    }
}

fn keypair_from_base58(encoded: &str) -> Result<Keypair> {
    let key_bytes = bs58::decode(encoded.trim())
        .into_vec()
        .map_err(|e| EngineError::Validation(format!("Invalid base58: {}", e)))?;
    if key_bytes.len() != 64 {
        return Err(EngineError::Validation(
            "Invalid Solana private key length".to_string(),
        ));
    }
    Keypair::from_bytes(&key_bytes)
        .map_err(|e| EngineError::Validation(format!("Invalid keypair: {}", e)))
}

// ==================== SOLANA WALLETS ====================

pub fn generate_solana_wallet() -> Keypair {
    Keypair::new()
}

pub fn import_solana_wallet(private_key: &str) -> Result<Keypair> {
    keypair_from_base58(private_key)
}

/// Creates the user's one custodial wallet, generating a key unless one is
/// imported. The ledger balance starts at zero.
pub async fn provision_wallet(
    ledger: &dyn LedgerStore,
    vault: &dyn KeyVault,
    user_id: i64,
    import_key: Option<&str>,
) -> Result<Wallet> {
    if ledger.wallet_for_user(user_id).await?.is_some() {
        return Err(EngineError::Validation(format!(
            "user {} already has a wallet",
            user_id
        )));
    }

    let keypair = match import_key {
        Some(key) => import_solana_wallet(key)?,
        None => generate_solana_wallet(),
    };
    let wallet = Wallet {
        id: Uuid::new_v4(),
        user_id,
        public_key: keypair.pubkey().to_string(),
        encrypted_private_key: vault.seal(&keypair)?,
        balance: Decimal::ZERO,
        last_updated: Utc::now(),
    };
    ledger.create_wallet(&wallet).await?;
    tracing::info!("🔐 Wallet {} provisioned for user {}", wallet.public_key, user_id);
    Ok(wallet)
}

/// Opens the wallet's key and checks it still matches the stored address.
pub fn signing_keypair(vault: &dyn KeyVault, wallet: &Wallet) -> Result<Keypair> {
    let keypair = vault.open(&wallet.encrypted_private_key)?;
    if keypair.pubkey().to_string() != wallet.public_key {
        return Err(EngineError::KeyVault(format!(
            "sealed key does not match wallet {}",
            wallet.public_key
        )));
    }
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    fn vault() -> MasterKeyVault {
        MasterKeyVault::new("unit-test-master-key-0123456789").unwrap()
    }

    #[test]
    fn sealed_key_opens_to_same_keypair() {
        let vault = vault();
        let keypair = generate_solana_wallet();
        let sealed = vault.seal(&keypair).unwrap();
        assert!(!sealed.contains(&bs58::encode(keypair.to_bytes()).into_string()));
        assert_eq!(vault.open(&sealed).unwrap().pubkey(), keypair.pubkey());
    }

    #[test]
    fn wrong_master_key_cannot_open() {
        let sealed = vault().seal(&generate_solana_wallet()).unwrap();
        let other = MasterKeyVault::new("a-completely-different-master-key").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn short_master_key_is_rejected() {
        assert!(matches!(MasterKeyVault::new("short"), Err(EngineError::Config(_))));
    }

    #[test]
    fn import_rejects_bad_keys() {
        assert!(import_solana_wallet("not-base58-0OIl").is_err());
        assert!(import_solana_wallet(&bs58::encode([7u8; 32]).into_string()).is_err());

        let keypair = generate_solana_wallet();
        let imported = import_solana_wallet(&bs58::encode(keypair.to_bytes()).into_string()).unwrap();
        assert_eq!(imported.pubkey(), keypair.pubkey());
    }

    #[tokio::test]
    async fn one_wallet_per_user() {
        let ledger = MemoryLedger::new();
        let vault = vault();
        let wallet = provision_wallet(&ledger, &vault, 9, None).await.unwrap();
        assert_eq!(wallet.balance, Decimal::ZERO);
        assert_eq!(
            signing_keypair(&vault, &wallet).unwrap().pubkey().to_string(),
            wallet.public_key
        );

        let again = provision_wallet(&ledger, &vault, 9, None).await;
        assert!(matches!(again, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn mismatched_sealed_key_is_refused() {
        let ledger = MemoryLedger::new();
        let vault = vault();
        let mut wallet = provision_wallet(&ledger, &vault, 3, None).await.unwrap();
        wallet.encrypted_private_key = vault.seal(&generate_solana_wallet()).unwrap();
        assert!(matches!(
            signing_keypair(&vault, &wallet),
            Err(EngineError::KeyVault(_))
        ));
    }
}
