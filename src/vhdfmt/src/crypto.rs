//! At-rest encryption: keyhash verification and XTS-AES sector transforms.
//!
//! The unit of encryption is one 512-byte sector; the XTS tweak is the
//! little-endian logical sector number. Key material is 256 or 512 bits,
//! split evenly between the two XTS cipher instances.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use aes::cipher::KeyInit;
use aes::{Aes128, Aes256};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use xts_mode::{get_tweak_default, Xts128};

use crate::chain::parent_path;
use crate::ondisk::Keyhash;
use crate::{OpenFlags, Result, VhdContext, VhdError, VHD_SECTOR_SIZE};

/// Key sizes in bits, in preference order.
pub const SUPPORTED_KEYSIZES: [usize; 2] = [512, 256];

pub const KEYDIR_ENV: &str = "TAPDISK3_CRYPTO_KEYDIR";

/// SHA-256 over nonce ∥ key.
pub fn calculate_keyhash(nonce: &[u8; 32], key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(key);
    hasher.finalize().into()
}

/// Fresh keyhash for `key` with a random nonce.
pub fn new_keyhash(key: &[u8]) -> Keyhash {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    Keyhash {
        cookie: 1,
        nonce,
        hash: calculate_keyhash(&nonce, key),
    }
}

/// Verify a supplied key against the stored keyhash.
pub fn check_key(key: &[u8], keyhash: &Keyhash) -> Result<()> {
    if !keyhash.is_set() {
        return Err(VhdError::NoKey);
    }

    if calculate_keyhash(&keyhash.nonce, key) != keyhash.hash {
        return Err(VhdError::KeyMismatch);
    }

    Ok(())
}

/// An XTS-AES transform bound to one image chain's key.
pub enum XtsContext {
    Aes128(Xts128<Aes128>),
    Aes256(Xts128<Aes256>),
}

impl XtsContext {
    /// `key` holds the full XTS key material: 32 bytes (AES-128 pair) or
    /// 64 bytes (AES-256 pair).
    pub fn new(key: &[u8]) -> Result<XtsContext> {
        match key.len() {
            32 => {
                let c1 = Aes128::new_from_slice(&key[..16])
                    .map_err(|_| VhdError::KeyMismatch)?;
                let c2 = Aes128::new_from_slice(&key[16..])
                    .map_err(|_| VhdError::KeyMismatch)?;
                Ok(XtsContext::Aes128(Xts128::new(c1, c2)))
            }
            64 => {
                let c1 = Aes256::new_from_slice(&key[..32])
                    .map_err(|_| VhdError::KeyMismatch)?;
                let c2 = Aes256::new_from_slice(&key[32..])
                    .map_err(|_| VhdError::KeyMismatch)?;
                Ok(XtsContext::Aes256(Xts128::new(c1, c2)))
            }
            bytes => Err(VhdError::invalid(
                "key",
                format!("unsupported key size {} bits", bytes * 8),
            )),
        }
    }

    /// Encrypt whole sectors in place; `lsec` is the logical sector number
    /// of the first sector in `buf`.
    pub fn encrypt(&self, lsec: u64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() as u64 % VHD_SECTOR_SIZE, 0);
        for (i, sector) in buf.chunks_exact_mut(VHD_SECTOR_SIZE as usize).enumerate() {
            let tweak = get_tweak_default(lsec as u128 + i as u128);
            match self {
                XtsContext::Aes128(x) => x.encrypt_sector(sector, tweak),
                XtsContext::Aes256(x) => x.encrypt_sector(sector, tweak),
            }
        }
    }

    pub fn decrypt(&self, lsec: u64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() as u64 % VHD_SECTOR_SIZE, 0);
        for (i, sector) in buf.chunks_exact_mut(VHD_SECTOR_SIZE as usize).enumerate() {
            let tweak = get_tweak_default(lsec as u128 + i as u128);
            match self {
                XtsContext::Aes128(x) => x.decrypt_sector(sector, tweak),
                XtsContext::Aes256(x) => x.decrypt_sector(sector, tweak),
            }
        }
    }
}

/// Locate `<basename>,aes-xts-plain,<bits>.key` under one of the directories
/// in a colon-or-comma-separated `dirs` list.
pub fn find_keyfile(dirs: &str, basename: &str, keybits: usize) -> Option<PathBuf> {
    for dir in dirs.split([':', ',']).filter(|d| !d.is_empty()) {
        let path = Path::new(dir).join(format!("{basename},aes-xts-plain,{keybits}.key"));
        if path.exists() {
            debug!(keyfile = %path.display(), "found keyfile");
            return Some(path);
        }
    }
    None
}

fn read_keyfile(path: &Path, keybits: usize) -> Result<Vec<u8>> {
    let mut key = vec![0u8; keybits / 8];
    let mut file = File::open(path)?;
    file.read_exact(&mut key)?;
    Ok(key)
}

/// Try key sizes in preference order; None when no keyfile exists.
pub fn read_preferred_keyfile(dirs: &str, basename: &str) -> Result<Option<Vec<u8>>> {
    for bits in SUPPORTED_KEYSIZES {
        if let Some(path) = find_keyfile(dirs, basename, bits) {
            return read_keyfile(&path, bits).map(Some);
        }
    }
    Ok(None)
}

/// Establish crypto for an image given an explicit key (or verify none is
/// needed when `key` is absent).
pub fn open_crypto_with_key(ctx: &VhdContext, key: Option<&[u8]>) -> Result<Option<XtsContext>> {
    let keyhash = ctx.get_keyhash()?.unwrap_or_default();

    match (keyhash.is_set(), key) {
        (false, None) => Ok(None),
        (false, Some(_)) => Err(VhdError::UnexpectedKey),
        (true, None) => Err(VhdError::NoKey),
        (true, Some(key)) => {
            check_key(key, &keyhash)?;
            debug!(path = %ctx.path().display(), "keyhash verified");
            XtsContext::new(key).map(Some)
        }
    }
}

/// Walk the chain looking for the image that carries the key, resolving key
/// material from the keydir search path.
///
/// A keyfile matching an image's basename is honoured even when that image
/// has no keyhash cookie, to catch an encrypted image being swapped for a
/// clear one; that case fails rather than silently opening.
pub fn chain_open_crypto(ctx: &VhdContext) -> Result<Option<XtsContext>> {
    let keydir = std::env::var(KEYDIR_ENV).ok();

    let mut current: Option<VhdContext> = None;
    loop {
        let image = current.as_ref().unwrap_or(ctx);
        let keyhash = image.get_keyhash()?.unwrap_or_default();

        let Some(dirs) = keydir.as_deref() else {
            if keyhash.is_set() {
                warn!(path = %image.path().display(), "encrypted image but {KEYDIR_ENV} unset");
                return Err(VhdError::NoKey);
            }

            if image.footer.disk_type != crate::DiskType::Diff {
                return Ok(None);
            }
            let ppath = parent_path(image)?;
            current = Some(VhdContext::open(
                ppath,
                OpenFlags::RDONLY | OpenFlags::QUIET | OpenFlags::NO_CACHE,
            )?);
            continue;
        };

        match read_preferred_keyfile(dirs, &image.basename())? {
            Some(key) => {
                if !keyhash.is_set() {
                    warn!(path = %image.path().display(), "keyfile present but image has no keyhash");
                    return Err(VhdError::UnexpectedKey);
                }
                check_key(&key, &keyhash)?;
                debug!(path = %image.path().display(), "using key from chain");
                return XtsContext::new(&key).map(Some);
            }
            None => {
                if keyhash.is_set() {
                    return Err(VhdError::NoKey);
                }
            }
        }

        if image.footer.disk_type != crate::DiskType::Diff {
            return Ok(None);
        }

        let ppath = parent_path(image)?;
        current = Some(VhdContext::open(
            ppath,
            OpenFlags::RDONLY | OpenFlags::QUIET | OpenFlags::NO_CACHE,
        )?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyhash_verifies_and_rejects() {
        let key = [0x42u8; 32];
        let kh = new_keyhash(&key);
        assert!(kh.is_set());
        check_key(&key, &kh).unwrap();

        let wrong = [0x43u8; 32];
        assert!(matches!(
            check_key(&wrong, &kh),
            Err(VhdError::KeyMismatch)
        ));

        let unset = Keyhash::default();
        assert!(matches!(check_key(&key, &unset), Err(VhdError::NoKey)));
    }

    #[test]
    fn xts_round_trip_identity() {
        for key_len in [32usize, 64] {
            let key: Vec<u8> = (0..key_len as u8).collect();
            let xts = XtsContext::new(&key).unwrap();

            let mut buf = vec![0u8; 1024];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            let orig = buf.clone();

            xts.encrypt(7, &mut buf);
            assert_ne!(buf, orig);
            xts.decrypt(7, &mut buf);
            assert_eq!(buf, orig);
        }
    }

    #[test]
    fn xts_tweak_depends_on_sector() {
        let key = [0x11u8; 32];
        let xts = XtsContext::new(&key).unwrap();

        let mut a = vec![0xaau8; 512];
        let mut b = vec![0xaau8; 512];
        xts.encrypt(0, &mut a);
        xts.encrypt(1, &mut b);
        assert_ne!(a, b);

        // Decrypting with the wrong sector number must not round-trip.
        xts.decrypt(1, &mut a);
        assert_ne!(a, vec![0xaau8; 512]);
    }

    #[test]
    fn rejects_bad_key_sizes() {
        assert!(XtsContext::new(&[0u8; 16]).is_err());
        assert!(XtsContext::new(&[0u8; 48]).is_err());
    }
}
