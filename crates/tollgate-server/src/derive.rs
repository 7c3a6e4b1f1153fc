//! One-time payment script derivation.
//!
//! Scripts are computed from the site's master extended public key alone;
//! no private material ever reaches the server. Uniqueness comes from the
//! derivation path `m/<worker>/<counter>`: the counter is a transactional
//! increment against the worker's own counters file, and the worker id keeps
//! concurrently minting workers out of each other's index space.

use bitcoin::ScriptBuf;
use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};

use crate::error::{Error, Result};
use crate::store::CounterStore;

/// A freshly minted payment output script and the path that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedScript {
    pub counter: i64,
    pub derivation_path: String,
    /// P2PKH output script for the derived key, hex encoded.
    pub script: String,
}

pub struct KeyDeriver {
    secp: Secp256k1<VerifyOnly>,
}

impl KeyDeriver {
    pub fn new() -> Self {
        KeyDeriver {
            secp: Secp256k1::verification_only(),
        }
    }

    /// Mint the next output script for `xpub`, consuming one counter value.
    pub fn next_output(
        &self,
        xpub: &Xpub,
        worker_id: u32,
        counters: &CounterStore,
    ) -> Result<DerivedScript> {
        let counter = counters.next_value(&xpub.to_string())?;
        let index = u32::try_from(counter).map_err(|_| Error::CounterOverflow(counter))?;

        let path = [
            ChildNumber::from_normal_idx(worker_id)?,
            ChildNumber::from_normal_idx(index)?,
        ];
        let child = xpub.derive_pub(&self.secp, &path)?;
        let pubkey = bitcoin::PublicKey::new(child.public_key);
        let script = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());

        Ok(DerivedScript {
            counter,
            derivation_path: format!("m/{worker_id}/{index}"),
            script: script.to_hex_string(),
        })
    }
}

impl Default for KeyDeriver {
    fn default() -> Self {
        KeyDeriver::new()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    // BIP32 test vector 1 master public key.
    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn counters(dir: &tempfile::TempDir, worker_id: u32) -> CounterStore {
        CounterStore::open(&dir.path().join(format!("counters-{worker_id}.db"))).unwrap()
    }

    #[test]
    fn mints_distinct_scripts_with_consecutive_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = counters(&dir, 0);
        let deriver = KeyDeriver::new();
        let xpub = Xpub::from_str(XPUB).unwrap();

        let first = deriver.next_output(&xpub, 0, &store).unwrap();
        let second = deriver.next_output(&xpub, 0, &store).unwrap();

        assert_eq!(first.derivation_path, "m/0/0");
        assert_eq!(second.derivation_path, "m/0/1");
        assert_ne!(first.script, second.script);

        // 25-byte P2PKH scripts: OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG.
        for script in [&first.script, &second.script] {
            assert_eq!(script.len(), 50);
            assert!(script.starts_with("76a914"));
            assert!(script.ends_with("88ac"));
        }
    }

    #[test]
    fn derivation_is_deterministic_per_path() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let deriver = KeyDeriver::new();
        let xpub = Xpub::from_str(XPUB).unwrap();

        // Two workers with independent counter files at the same index must
        // still diverge, because the path embeds the worker id.
        let w0 = deriver.next_output(&xpub, 0, &counters(&dir_a, 0)).unwrap();
        let w1 = deriver.next_output(&xpub, 1, &counters(&dir_b, 1)).unwrap();
        assert_eq!(w0.counter, w1.counter);
        assert_ne!(w0.script, w1.script);

        // Same path, fresh store: the same script comes back.
        let dir_c = tempfile::tempdir().unwrap();
        let again = deriver.next_output(&xpub, 0, &counters(&dir_c, 0)).unwrap();
        assert_eq!(again.script, w0.script);
    }
}
