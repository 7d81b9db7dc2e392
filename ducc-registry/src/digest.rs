//! Digest verification helpers shared by manifest and blob fetches.

use oci_spec::image::{Digest, DigestAlgorithm};
use sha2::Sha256;

use crate::Error;

pub fn digest_from_data(data: impl AsRef<[u8]>) -> Digest {
    use sha2::Digest as _;
    use std::str::FromStr;
    oci_spec::image::Sha256Digest::from_str(&hex::encode(Sha256::digest(data)))
        .expect("sha256 hex digest is always well formed")
        .into()
}

pub fn check_digest_matches(expected: &Digest, hasher: impl sha2::Digest) -> Result<(), Error> {
    if digest_eq(expected.digest(), hasher) {
        Ok(())
    } else {
        Err(Error::IntegrityMismatch)
    }
}

pub fn check_data_matches_digest(expected: Option<&Digest>, data: &[u8]) -> Result<(), Error> {
    match expected {
        Some(expected) if data_matches_digest(expected, data)? => Ok(()),
        Some(_) => Err(Error::IntegrityMismatch),
        None => Ok(()),
    }
}

pub fn check_data_matches_size_and_digest(
    expected_size: u64,
    expected_digest: &Digest,
    data: &[u8],
) -> Result<(), Error> {
    if expected_size != data.len() as u64 {
        Err(Error::SizeMismatch)
    } else if !data_matches_digest(expected_digest, data)? {
        Err(Error::IntegrityMismatch)
    } else {
        Ok(())
    }
}

pub fn data_matches_digest(expected: &Digest, data: &[u8]) -> Result<bool, Error> {
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            use sha2::Digest as _;
            let mut hasher = Sha256::new();
            hasher.update(data);
            Ok(digest_eq(expected.digest(), hasher))
        }
        algo => Err(Error::DigestAlgorithmNotHandled(algo.to_string())),
    }
}

// checks without allocating a byte buffer for the hex string: nibble by nibble against a lookup
// table instead of decoding digest_lower_hex_str and comparing byte vectors
pub fn digest_eq(digest_lower_hex_str: &str, digest: impl sha2::Digest) -> bool {
    let digest_bytes = digest.finalize();
    let l = digest_lower_hex_str.len();
    if l != 2 * digest_bytes.len() {
        return false;
    }

    #[rustfmt::skip]
    const LUT: [u8; 16] = [
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
        97, 98, 99, 100, 101, 102,
    ];
    let as_byte_pairs = <str as AsRef<[u8]>>::as_ref(digest_lower_hex_str).chunks_exact(2);

    as_byte_pairs.zip(digest_bytes).all(|(pair, byte)| {
        LUT[(byte >> 4) as usize] == pair[0] && LUT[(byte & 0xf) as usize] == pair[1]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_eq() {
        fn sha256_digest(data: impl AsRef<[u8]>) -> impl sha2::Digest {
            use sha2::Digest as _;
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher
        }
        assert!(digest_eq(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            sha256_digest("abc"),
        ));
        assert!(!digest_eq(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015a",
            sha256_digest("abc"),
        ));
        assert!(!digest_eq(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ae",
            sha256_digest("abc"),
        ));
    }
}
