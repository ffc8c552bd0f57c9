//! # プロセスアイデンティティとAttestationエンベロープ
//!
//! 長期Ed25519署名鍵（プロセス存続期間のみ保持）と、ピアセッションごとの
//! X25519エフェメラル鍵ペアを管理する。
//!
//! ## 鍵の束縛
//! Quoteのreport_dataは `SHA-256(ed25519_pub || x25519_pub || nonce)` であり、
//! 両鍵とアンチリプレイノンスがハードウェア署名済み測定に束縛される。

use base64::Engine;

use challenge_crypto::{
    ed25519_sign, ed25519_to_x25519, sha256, Ed25519SigningKey, Ed25519VerifyingKey,
    X25519Public, X25519Secret,
};
use challenge_types::{AttestationEnvelope, PeerRole};

use crate::error::AttestationError;
use crate::runtime::QuoteProvider;

/// Base64エンジン（Standard）
pub(crate) fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// セッション用X25519エフェメラル鍵ペア。セッション間で再利用しない。
pub struct SessionEphemeral {
    /// エフェメラル秘密鍵
    pub secret: X25519Secret,
    /// エフェメラル公開鍵
    pub public: X25519Public,
}

/// プロセスの長期アイデンティティ。
/// 署名鍵はドロップ時にゼロ化される（ed25519-dalekのzeroize実装による）。
pub struct Identity {
    signing: Ed25519SigningKey,
}

impl Identity {
    /// 新しいアイデンティティを生成する。プロセス起動時に一度だけ呼ばれる。
    pub fn generate() -> Self {
        let signing = Ed25519SigningKey::generate(&mut rand::rngs::OsRng);
        Self { signing }
    }

    /// 検証用公開鍵。
    pub fn verifying_key(&self) -> Ed25519VerifyingKey {
        self.signing.verifying_key()
    }

    /// Base64エンコードされた公開鍵（署名付きHTTPヘッダ用）。
    pub fn public_key_b64(&self) -> String {
        b64().encode(self.verifying_key().to_bytes())
    }

    /// 長期鍵でメッセージに署名する。
    pub fn sign(&self, message: &[u8]) -> challenge_crypto::Ed25519Signature {
        ed25519_sign(&self.signing, message)
    }

    /// 署名付きHTTPクライアント用に署名鍵の複製を取り出す。
    pub fn signing_key(&self) -> Ed25519SigningKey {
        self.signing.clone()
    }

    /// 封緘済み資格情報の受信用X25519秘密鍵。
    /// 長期Ed25519鍵から双有理写像で導出する（鍵結合はプロトコル仕様）。
    pub fn credential_secret(&self) -> X25519Secret {
        ed25519_to_x25519(&self.signing)
    }

    /// 封緘済み資格情報の受信用X25519公開鍵。Adminはこの鍵に封緘する。
    pub fn credential_public(&self) -> X25519Public {
        X25519Public::from(&self.credential_secret())
    }

    /// セッション用X25519エフェメラル鍵ペアを生成する。
    pub fn mint_session_ephemeral(&self) -> SessionEphemeral {
        let secret = X25519Secret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret);
        SessionEphemeral { secret, public }
    }

    /// 署名付きAttestationエンベロープを構築する。
    ///
    /// 署名対象は `nonce || ed25519_pub || x25519_pub || role_byte || quote || event_log`
    /// の連結。
    pub fn attestation_envelope(
        &self,
        provider: &dyn QuoteProvider,
        role: PeerRole,
        nonce: &[u8; 32],
        ephemeral_public: &X25519Public,
    ) -> Result<AttestationEnvelope, AttestationError> {
        let ed_pub = self.verifying_key().to_bytes();
        let x_pub = ephemeral_public.as_bytes();

        let mut bound = Vec::with_capacity(32 + 32 + 32);
        bound.extend_from_slice(&ed_pub);
        bound.extend_from_slice(x_pub);
        bound.extend_from_slice(nonce);
        let report_data = sha256(&bound);

        let bundle = provider.quote(&report_data)?;

        let mut sign_target = Vec::new();
        sign_target.extend_from_slice(nonce);
        sign_target.extend_from_slice(&ed_pub);
        sign_target.extend_from_slice(x_pub);
        sign_target.push(role.role_byte());
        sign_target.extend_from_slice(&bundle.quote);
        sign_target.extend_from_slice(&bundle.event_log);
        let signature = self.sign(&sign_target);

        Ok(AttestationEnvelope {
            role,
            nonce: b64().encode(nonce),
            ed25519_pub: b64().encode(ed_pub),
            x25519_pub: b64().encode(x_pub),
            quote: b64().encode(&bundle.quote),
            event_log: b64().encode(&bundle.event_log),
            signature: b64().encode(signature.to_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use challenge_crypto::ed25519_verify;

    use crate::runtime::dev::DevQuoteProvider;

    /// エンベロープの署名が公開鍵で検証できることを確認
    #[test]
    fn test_envelope_signature_verifies() {
        let identity = Identity::generate();
        let provider = DevQuoteProvider::new();
        let nonce = [0x01u8; 32];
        let eph = identity.mint_session_ephemeral();

        let envelope = identity
            .attestation_envelope(&provider, PeerRole::Consumer, &nonce, &eph.public)
            .unwrap();

        // 署名対象を再構築
        let ed_pub = b64().decode(&envelope.ed25519_pub).unwrap();
        let x_pub = b64().decode(&envelope.x25519_pub).unwrap();
        let quote = b64().decode(&envelope.quote).unwrap();
        let event_log = b64().decode(&envelope.event_log).unwrap();
        let mut sign_target = Vec::new();
        sign_target.extend_from_slice(&nonce);
        sign_target.extend_from_slice(&ed_pub);
        sign_target.extend_from_slice(&x_pub);
        sign_target.push(PeerRole::Consumer.role_byte());
        sign_target.extend_from_slice(&quote);
        sign_target.extend_from_slice(&event_log);

        let sig_bytes: [u8; 64] = b64()
            .decode(&envelope.signature)
            .unwrap()
            .try_into()
            .unwrap();
        let signature = challenge_crypto::Ed25519Signature::from_bytes(&sig_bytes);
        assert!(ed25519_verify(&identity.verifying_key(), &sign_target, &signature).is_ok());

        // 1バイト改竄で検証が落ちる
        sign_target[0] ^= 0xFF;
        assert!(ed25519_verify(&identity.verifying_key(), &sign_target, &signature).is_err());
    }

    /// セッションごとのエフェメラル鍵が毎回異なることを確認
    #[test]
    fn test_ephemeral_freshness() {
        let identity = Identity::generate();
        let a = identity.mint_session_ephemeral();
        let b = identity.mint_session_ephemeral();
        assert_ne!(a.public.as_bytes(), b.public.as_bytes());
    }

    /// 資格情報受信鍵ペアが整合することを確認
    #[test]
    fn test_credential_keys_consistent() {
        let identity = Identity::generate();
        let sealed =
            challenge_crypto::sealed_seal(&identity.credential_public(), b"postgres://dsn")
                .unwrap();
        let opened =
            challenge_crypto::sealed_open(&identity.credential_secret(), &sealed).unwrap();
        assert_eq!(opened, b"postgres://dsn");
    }
}
