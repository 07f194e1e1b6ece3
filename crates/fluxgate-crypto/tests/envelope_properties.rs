//! Property-based tests for the AEAD payload envelope.

use fluxgate_crypto::{CryptoService, EncryptionKey, KEY_SIZE, KeyStore, NONCE_SIZE, TAG_SIZE};
use proptest::prelude::*;
use uuid::Uuid;

fn service(material: [u8; KEY_SIZE]) -> CryptoService {
    let store = KeyStore::new();
    store
        .load(vec![EncryptionKey::new(Uuid::new_v4(), "prop", material).activated()])
        .expect("load");
    CryptoService::new(store)
}

proptest! {
    #[test]
    fn round_trip_any_plaintext(material in any::<[u8; KEY_SIZE]>(), plaintext in prop::collection::vec(any::<u8>(), 0..4096)) {
        let service = service(material);

        let wire = service.encrypt(&plaintext).expect("encrypt");
        prop_assert_eq!(wire.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let decrypted = service.decrypt(&wire).expect("decrypt");
        prop_assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn single_bit_flip_is_rejected(material in any::<[u8; KEY_SIZE]>(), plaintext in prop::collection::vec(any::<u8>(), 1..256), flip in any::<prop::sample::Index>()) {
        let service = service(material);

        let mut wire = service.encrypt(&plaintext).expect("encrypt");
        let at = flip.index(wire.len());
        wire[at] ^= 0x01;

        prop_assert!(service.decrypt(&wire).is_err());
    }
}
