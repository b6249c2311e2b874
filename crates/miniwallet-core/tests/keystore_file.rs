use miniwallet_core::auth::ScryptParams;
use miniwallet_core::error::SecurityError;
use miniwallet_core::keystore::{self, KdfParams, KeystoreFile};

const PRIVATE_KEY_HEX: &str = "7a28b5ba57c53603b0b07b56bba752f7784bf506fa95edc395f5cf6c7514fe9d";

#[test]
fn keystore_written_to_disk_decrypts_with_same_password() {
    let dir = tempfile::tempdir().expect("tempdir");
    let private_key = hex::decode(PRIVATE_KEY_HEX).expect("hex");

    let file = keystore::encrypt(
        &private_key,
        "testpassword",
        "0x008AeEda4D805471dF9b2A5B0f38A0C3bCBA786b",
        KdfParams::new_scrypt(ScryptParams::LIGHT),
    )
    .expect("encrypt");
    let path = dir.path().join(file.file_name(time::OffsetDateTime::now_utc()));
    std::fs::write(&path, file.to_json_pretty().expect("json")).expect("write keystore");

    let bytes = std::fs::read(&path).expect("read keystore");
    let loaded = KeystoreFile::from_json(&bytes).expect("parse");
    assert_eq!(loaded, file);

    let creds = keystore::decrypt(&loaded, "testpassword").expect("decrypt");
    assert_eq!(hex::encode(creds.private_key.as_slice()), PRIVATE_KEY_HEX);
    assert_eq!(creds.address, "008aeeda4d805471df9b2a5b0f38a0c3bcba786b");

    let wrong = keystore::decrypt(&loaded, "testpassword2");
    assert!(
        matches!(wrong, Err(SecurityError::Authentication)),
        "wrong password must be reported as an authentication failure"
    );
}

#[test]
fn capitalized_crypto_key_is_accepted() {
    let file =
        keystore::encrypt(&[1u8; 32], "pw", "ab", KdfParams::new_pbkdf2(64)).expect("encrypt");
    let text = file.to_json_pretty().expect("json").replacen("\"crypto\"", "\"Crypto\"", 1);
    let loaded = KeystoreFile::from_json(text.as_bytes()).expect("parse capitalized");
    let creds = keystore::decrypt(&loaded, "pw").expect("decrypt");
    assert_eq!(creds.private_key.as_slice(), &[1u8; 32]);
}

#[test]
fn corrupted_mac_field_is_a_keystore_error_not_a_wrong_password() {
    let mut file =
        keystore::encrypt(&[2u8; 32], "pw", "ab", KdfParams::new_pbkdf2(64)).expect("encrypt");
    file.crypto.mac = "zz-not-hex".into();
    assert!(matches!(keystore::decrypt(&file, "pw"), Err(SecurityError::Keystore(_))));
}

/// Web3 Secret Storage 公开测试向量（pbkdf2）。
const PBKDF2_VECTOR: &str = r#"{
    "crypto": {
        "cipher": "aes-128-ctr",
        "cipherparams": { "iv": "6087dab2f9fdbbfaddc31a909735c1e6" },
        "ciphertext": "5318b4d5bcd28de64ee5559e671353e16f075ecae9f99c7a79a38af5f869aa46",
        "kdf": "pbkdf2",
        "kdfparams": {
            "c": 262144,
            "dklen": 32,
            "prf": "hmac-sha256",
            "salt": "ae3cd4e7013836a3df6bd7241b12db061dbe2c6785853cce422d148a624ce0bd"
        },
        "mac": "517ead924a9d0dc3124507e3393d175ce3ff7c1e96529c6c555ce9e51205e9b2"
    },
    "id": "3198bc9c-6672-5ab3-d995-4942343ae5b6",
    "version": 3
}"#;

/// Web3 Secret Storage 公开测试向量（scrypt）。
const SCRYPT_VECTOR: &str = r#"{
    "crypto": {
        "cipher": "aes-128-ctr",
        "cipherparams": { "iv": "83dbcc02d8ccb40e466191a123791e0e" },
        "ciphertext": "d172bf743a674da9cdad04534d56926ef8358534d458fffccd4e6ad2fbde479c",
        "kdf": "scrypt",
        "kdfparams": {
            "dklen": 32,
            "n": 262144,
            "p": 8,
            "r": 1,
            "salt": "ab0c7876052600dd703518d6fc3fe8984592145b591fc8fb5c6d43190334ba19"
        },
        "mac": "2103ac29920d71da29f15d75b4a16dbe95cfd7ff8faea1056c33131d846e3097"
    },
    "id": "3198bc9c-6672-5ab3-d995-4942343ae5b6",
    "version": 3
}"#;

#[test]
fn decrypts_published_pbkdf2_vector() {
    let file = KeystoreFile::from_json(PBKDF2_VECTOR.as_bytes()).expect("parse vector");
    let creds = keystore::decrypt(&file, "testpassword").expect("decrypt vector");
    assert_eq!(hex::encode(creds.private_key.as_slice()), PRIVATE_KEY_HEX);
    assert!(matches!(
        keystore::decrypt(&file, "testpassword2"),
        Err(SecurityError::Authentication)
    ));
}

#[test]
fn decrypts_published_scrypt_vector() {
    let file = KeystoreFile::from_json(SCRYPT_VECTOR.as_bytes()).expect("parse vector");
    let creds = keystore::decrypt(&file, "testpassword").expect("decrypt vector");
    assert_eq!(hex::encode(creds.private_key.as_slice()), PRIVATE_KEY_HEX);
}
