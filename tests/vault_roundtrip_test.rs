//! Vault round-trip across independent instances.

use praktor::domain::GatewayError;
use praktor::infrastructure::vault::Vault;

#[test]
fn fresh_instances_with_same_passphrase_interoperate() {
    let v1 = Vault::new("correct horse battery staple").unwrap();
    let v2 = Vault::new("correct horse battery staple").unwrap();

    let (ciphertext, nonce) = v1.encrypt(b"the payload").unwrap();
    assert_eq!(v2.decrypt(&ciphertext, &nonce).unwrap(), b"the payload");
}

#[test]
fn different_passphrase_cannot_open() {
    let v1 = Vault::new("alpha").unwrap();
    let v2 = Vault::new("beta").unwrap();

    let (ciphertext, nonce) = v1.encrypt(b"payload").unwrap();
    assert!(matches!(
        v2.decrypt(&ciphertext, &nonce).unwrap_err(),
        GatewayError::BadKey
    ));
}

#[test]
fn tampered_ciphertext_fails_authentication() {
    let vault = Vault::new("passphrase").unwrap();
    let (mut ciphertext, nonce) = vault.encrypt(b"payload").unwrap();
    ciphertext[0] ^= 0xff;
    assert!(vault.decrypt(&ciphertext, &nonce).is_err());
}

#[test]
fn empty_and_binary_payloads_round_trip() {
    let vault = Vault::new("passphrase").unwrap();
    for payload in [&b""[..], &[0u8, 255, 1, 254][..]] {
        let (ciphertext, nonce) = vault.encrypt(payload).unwrap();
        assert_eq!(vault.decrypt(&ciphertext, &nonce).unwrap(), payload);
    }
}
