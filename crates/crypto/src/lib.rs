//! # Challenge Sidecar 暗号処理
//!
//! サイドカーが使用する暗号プリミティブの型付きラッパーを提供する。
//! プリミティブ自体は検証済みライブラリに委ね、ここでは鍵・ノンス長の
//! 固定とエラーの正規化のみを行う。
//!
//! ## 暗号アルゴリズム
//! | 用途 | アルゴリズム |
//! |------|------------|
//! | 鍵交換 | X25519 ECDH |
//! | 鍵導出 | HKDF-SHA256 |
//! | 対称暗号 | ChaCha20-Poly1305 |
//! | 署名 | Ed25519 |
//! | ハッシュ | SHA-256 |
//!
//! ## 鍵の結合について
//! 封緘済み資格情報の受信鍵は、長期Ed25519署名鍵から双有理写像で導出した
//! X25519鍵を再利用する。署名鍵と復号鍵が結合される設計であり、専用の
//! 暗号化鍵ペアへの移行はプロトコルバージョンの更新を伴う。

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

pub use ed25519_dalek::{
    Signature as Ed25519Signature, SigningKey as Ed25519SigningKey,
    VerifyingKey as Ed25519VerifyingKey,
};
pub use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

/// 対称鍵（ChaCha20-Poly1305用、32バイト）
pub type SymmetricKey = [u8; 32];

/// AEADノンス長（バイト）
pub const AEAD_NONCE_LEN: usize = 12;
/// AEAD認証タグ長（バイト）
pub const AEAD_TAG_LEN: usize = 16;
/// X25519公開鍵長（バイト）
pub const X25519_PUB_LEN: usize = 32;

/// sealed box用HKDFソルト
const SEALED_HKDF_SALT: &[u8] = b"challenge-credential-transfer-v1";
/// sealed box用HKDF infoラベル
const SEALED_HKDF_INFO: &[u8] = b"credential-encryption";

/// 暗号処理のエラー型
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// 署名検証エラー
    #[error("署名の検証に失敗しました")]
    Verify,
    /// 復号・認証エラー
    #[error("復号に失敗しました")]
    Decrypt,
    /// CSPRNG・鍵導出エラー
    #[error("乱数生成または鍵導出に失敗しました")]
    Entropy,
}

// ---------------------------------------------------------------------------
// Ed25519署名
// ---------------------------------------------------------------------------

/// Ed25519による署名。
pub fn ed25519_sign(signing_key: &Ed25519SigningKey, message: &[u8]) -> Ed25519Signature {
    signing_key.sign(message)
}

/// Ed25519による署名検証。
pub fn ed25519_verify(
    verifying_key: &Ed25519VerifyingKey,
    message: &[u8],
    signature: &Ed25519Signature,
) -> Result<(), CryptoError> {
    verifying_key
        .verify(message, signature)
        .map_err(|_| CryptoError::Verify)
}

// ---------------------------------------------------------------------------
// X25519 ECDH・HKDF-SHA256
// ---------------------------------------------------------------------------

/// X25519 ECDHによる共有秘密の導出。
pub fn dh(secret_key: &X25519StaticSecret, public_key: &X25519PublicKey) -> [u8; 32] {
    let shared = secret_key.diffie_hellman(public_key);
    *shared.as_bytes()
}

/// HKDF-SHA256による鍵素材の導出。
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm).map_err(|_| CryptoError::Entropy)?;
    Ok(okm)
}

/// HKDF-SHA256による32バイト対称鍵の導出。
pub fn hkdf_derive_key(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key).map_err(|_| CryptoError::Entropy)?;
    Ok(key)
}

// ---------------------------------------------------------------------------
// ChaCha20-Poly1305 AEAD
// ---------------------------------------------------------------------------

/// ChaCha20-Poly1305による暗号化。`ct || tag` を返す。
pub fn aead_seal(
    key: &SymmetricKey,
    nonce: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Entropy)?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Entropy)
}

/// ChaCha20-Poly1305による復号。`ct || tag` を受け取る。
pub fn aead_open(
    key: &SymmetricKey,
    nonce: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

// ---------------------------------------------------------------------------
// Sealed box（匿名公開鍵暗号）
// ---------------------------------------------------------------------------

/// 受信者のX25519公開鍵に対する封緘。
/// レイアウト: `eph_pub(32) || nonce(12) || ct||tag`。
/// 送信者のエフェメラル公開鍵をAADとして認証に束縛する。
pub fn sealed_seal(
    recipient_pub: &X25519PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let eph_secret = X25519StaticSecret::random_from_rng(OsRng);
    let eph_pub = X25519PublicKey::from(&eph_secret);

    let shared = dh(&eph_secret, recipient_pub);
    let key = hkdf_derive_key(SEALED_HKDF_SALT, &shared, SEALED_HKDF_INFO)?;

    let nonce = random_array::<AEAD_NONCE_LEN>()?;
    let ct = aead_seal(&key, &nonce, eph_pub.as_bytes(), plaintext)?;

    let mut out = Vec::with_capacity(X25519_PUB_LEN + AEAD_NONCE_LEN + ct.len());
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// sealed boxの開封。自身のX25519秘密鍵で復号する。
pub fn sealed_open(secret: &X25519StaticSecret, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < X25519_PUB_LEN + AEAD_NONCE_LEN + AEAD_TAG_LEN {
        return Err(CryptoError::Decrypt);
    }
    let mut eph_bytes = [0u8; X25519_PUB_LEN];
    eph_bytes.copy_from_slice(&sealed[..X25519_PUB_LEN]);
    let eph_pub = X25519PublicKey::from(eph_bytes);

    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce.copy_from_slice(&sealed[X25519_PUB_LEN..X25519_PUB_LEN + AEAD_NONCE_LEN]);
    let ct = &sealed[X25519_PUB_LEN + AEAD_NONCE_LEN..];

    let shared = dh(secret, &eph_pub);
    let key = hkdf_derive_key(SEALED_HKDF_SALT, &shared, SEALED_HKDF_INFO)?;
    aead_open(&key, &nonce, &eph_bytes, ct)
}

// ---------------------------------------------------------------------------
// Ed25519 → X25519 変換（双有理写像）
// ---------------------------------------------------------------------------

/// Ed25519秘密鍵からX25519秘密鍵を導出する。
/// SHA-512(seed)の下位32バイトをクランプした標準的な変換。
pub fn ed25519_to_x25519(signing_key: &Ed25519SigningKey) -> X25519StaticSecret {
    let hash = Sha512::digest(signing_key.to_bytes());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    X25519StaticSecret::from(scalar)
}

/// Ed25519公開鍵に対応するX25519公開鍵（Montgomery形式）。
pub fn ed25519_public_to_x25519(verifying_key: &Ed25519VerifyingKey) -> X25519PublicKey {
    X25519PublicKey::from(verifying_key.to_montgomery().to_bytes())
}

// ---------------------------------------------------------------------------
// CSPRNG・ハッシュ
// ---------------------------------------------------------------------------

/// CSPRNGからnバイトの乱数を取得する。
pub fn random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|_| CryptoError::Entropy)?;
    Ok(buf)
}

/// CSPRNGから固定長の乱数配列を取得する。
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|_| CryptoError::Entropy)?;
    Ok(buf)
}

/// SHA-256ハッシュ計算。
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 署名が正しい鍵で検証でき、別鍵では失敗することを確認
    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519SigningKey::generate(&mut OsRng);
        let other = Ed25519SigningKey::generate(&mut OsRng);
        let msg = b"canonical request";

        let sig = ed25519_sign(&key, msg);
        assert!(ed25519_verify(&key.verifying_key(), msg, &sig).is_ok());
        assert!(matches!(
            ed25519_verify(&other.verifying_key(), msg, &sig),
            Err(CryptoError::Verify)
        ));
        assert!(matches!(
            ed25519_verify(&key.verifying_key(), b"mutated", &sig),
            Err(CryptoError::Verify)
        ));
    }

    /// AEADの暗号化・復号と改竄検出を確認
    #[test]
    fn test_aead_roundtrip_and_tamper() {
        let key = random_array::<32>().unwrap();
        let nonce = random_array::<AEAD_NONCE_LEN>().unwrap();
        let aad = b"role=A,00000000";

        let ct = aead_seal(&key, &nonce, aad, b"hello").unwrap();
        assert_eq!(aead_open(&key, &nonce, aad, &ct).unwrap(), b"hello");

        // 暗号文の改竄
        let mut tampered = ct.clone();
        tampered[0] ^= 0x01;
        assert!(matches!(
            aead_open(&key, &nonce, aad, &tampered),
            Err(CryptoError::Decrypt)
        ));

        // AADの改竄
        assert!(matches!(
            aead_open(&key, &nonce, b"role=C,00000000", &ct),
            Err(CryptoError::Decrypt)
        ));

        // 別鍵での復号
        let other_key = random_array::<32>().unwrap();
        assert!(matches!(
            aead_open(&other_key, &nonce, aad, &ct),
            Err(CryptoError::Decrypt)
        ));
    }

    /// sealed boxの往復と、別鍵での開封失敗を確認
    #[test]
    fn test_sealed_box_roundtrip() {
        let recipient = X25519StaticSecret::random_from_rng(OsRng);
        let recipient_pub = X25519PublicKey::from(&recipient);
        let dsn = b"postgres://u:p@h/db";

        let sealed = sealed_seal(&recipient_pub, dsn).unwrap();
        assert_eq!(sealed_open(&recipient, &sealed).unwrap(), dsn);

        let wrong = X25519StaticSecret::random_from_rng(OsRng);
        assert!(matches!(
            sealed_open(&wrong, &sealed),
            Err(CryptoError::Decrypt)
        ));

        // 短すぎる入力
        assert!(matches!(
            sealed_open(&recipient, &sealed[..40]),
            Err(CryptoError::Decrypt)
        ));
    }

    /// Ed25519から導出したX25519鍵ペアが整合することを確認
    #[test]
    fn test_ed25519_to_x25519_consistency() {
        let ed = Ed25519SigningKey::generate(&mut OsRng);
        let x_secret = ed25519_to_x25519(&ed);
        let x_pub_from_secret = X25519PublicKey::from(&x_secret);
        let x_pub_from_verifying = ed25519_public_to_x25519(&ed.verifying_key());
        assert_eq!(x_pub_from_secret.as_bytes(), x_pub_from_verifying.as_bytes());

        // 導出鍵でsealed boxが開封できる
        let sealed = sealed_seal(&x_pub_from_verifying, b"dsn").unwrap();
        assert_eq!(sealed_open(&x_secret, &sealed).unwrap(), b"dsn");
    }

    /// 同一入力のHKDFが決定的で、ソルト・infoの違いで鍵が変わることを確認
    #[test]
    fn test_hkdf_derivation() {
        let ikm = [0x42u8; 32];
        let k1 = hkdf_derive_key(b"salt-a", &ikm, b"info-a").unwrap();
        let k2 = hkdf_derive_key(b"salt-a", &ikm, b"info-a").unwrap();
        let k3 = hkdf_derive_key(b"salt-b", &ikm, b"info-a").unwrap();
        let k4 = hkdf_derive_key(b"salt-a", &ikm, b"info-b").unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k1, k4);

        let okm = hkdf(b"salt", &ikm, b"info", 64).unwrap();
        assert_eq!(okm.len(), 64);
    }

    /// 乱数列が重複しないことを確認
    #[test]
    fn test_random_bytes_distinct() {
        let a = random_bytes(32).unwrap();
        let b = random_bytes(32).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    /// SHA-256の既知ベクトルを確認
    #[test]
    fn test_sha256_vector() {
        let digest = sha256(b"abc");
        assert_eq!(
            hex_string(&digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    fn hex_string(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
