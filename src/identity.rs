use sha2::{Digest, Sha224};
use uuid::Uuid;

/// Length of the hex-encoded SHA-224 Trojan password
pub const TROJAN_HASH_LEN: usize = 56;

/// Credentials shared by every tunnel session, derived once from the configured UUID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    uuid: Uuid,
    dashed: String,
    trojan_hash: String,
}

impl Identity {
    /// Build the identity from the configured UUID string.
    ///
    /// The Trojan password is the SHA-224 of the string exactly as configured,
    /// which is what clients are handed in the subscription link.
    pub fn parse(uuid_str: &str) -> Result<Self, uuid::Error> {
        let dashed = uuid_str.trim().to_string();
        let uuid = Uuid::parse_str(&dashed)?;
        let trojan_hash = hex::encode(Sha224::digest(dashed.as_bytes()));

        Ok(Self {
            uuid,
            dashed,
            trojan_hash,
        })
    }

    pub fn uuid_bytes(&self) -> &[u8; 16] {
        self.uuid.as_bytes()
    }

    /// UUID as configured (dashed form)
    pub fn dashed(&self) -> &str {
        &self.dashed
    }

    pub fn trojan_hash(&self) -> &str {
        &self.trojan_hash
    }
}
