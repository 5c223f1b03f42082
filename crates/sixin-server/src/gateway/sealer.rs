//! At-rest protection of chat message bodies.
//!
//! When a master key is configured, `text` is replaced by
//! `{"sealed": "<hex onion blob>"}` before the message reaches the store and
//! restored when history is read back. Key derivation is CPU-bound, so both
//! directions run on the blocking pool.

use serde_json::{json, Value};
use sixin_core::{ChatMessage, OnionCipher, SixinError, SixinResult};
use std::sync::Arc;

const SEALED_FIELD: &str = "sealed";

#[derive(Clone)]
pub struct MessageSealer {
    key: Arc<Vec<u8>>,
    cipher: OnionCipher,
}

impl MessageSealer {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key: Arc::new(key),
            cipher: OnionCipher::default(),
        }
    }

    #[cfg(test)]
    pub fn with_cipher(key: Vec<u8>, cipher: OnionCipher) -> Self {
        Self {
            key: Arc::new(key),
            cipher,
        }
    }

    /// Return a copy of `message` whose text is sealed.
    pub async fn seal(&self, message: &ChatMessage) -> SixinResult<ChatMessage> {
        let plaintext = serde_json::to_vec(&message.text)?;
        let key = Arc::clone(&self.key);
        let cipher = self.cipher;
        let sealed = tokio::task::spawn_blocking(move || cipher.encrypt(&plaintext, &key))
            .await
            .map_err(|e| SixinError::Other(format!("seal task failed: {e}")))??;

        let mut stored = message.clone();
        stored.text = json!({ SEALED_FIELD: hex::encode(sealed) });
        Ok(stored)
    }

    /// Restore the text of a stored message in place. Messages that were
    /// never sealed pass through untouched.
    pub async fn open(&self, message: &mut ChatMessage) -> SixinResult<()> {
        let Some(blob) = sealed_blob(&message.text) else {
            return Ok(());
        };
        let sealed = hex::decode(blob)
            .map_err(|_| SixinError::Store(format!("message {} has a corrupt sealed body", message.id)))?;
        let key = Arc::clone(&self.key);
        let cipher = self.cipher;
        let plaintext = tokio::task::spawn_blocking(move || cipher.decrypt(&sealed, &key))
            .await
            .map_err(|e| SixinError::Other(format!("open task failed: {e}")))??;
        message.text = serde_json::from_slice(&plaintext)?;
        Ok(())
    }
}

fn sealed_blob(text: &Value) -> Option<&str> {
    let obj = text.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(SEALED_FIELD)?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sixin_core::CryptoError;

    fn sealer(key: &[u8]) -> MessageSealer {
        MessageSealer::with_cipher(key.to_vec(), OnionCipher::with_iterations(1))
    }

    #[tokio::test]
    async fn seal_then_open() {
        let s = sealer(b"k");
        let msg = ChatMessage {
            text: json!({"content": "hello", "mentions": [1, 2]}),
            listener_id: 2,
            ..Default::default()
        };
        let mut stored = s.seal(&msg).await.unwrap();
        assert!(sealed_blob(&stored.text).is_some());
        assert_ne!(stored.text, msg.text);

        s.open(&mut stored).await.unwrap();
        assert_eq!(stored, msg);
    }

    #[tokio::test]
    async fn plain_messages_pass_through() {
        let s = sealer(b"k");
        let mut msg = ChatMessage {
            text: json!({"content": "not sealed"}),
            ..Default::default()
        };
        let before = msg.clone();
        s.open(&mut msg).await.unwrap();
        assert_eq!(msg, before);
    }

    #[tokio::test]
    async fn wrong_key_surfaces_crypto_error() {
        let msg = ChatMessage {
            text: json!("x"),
            ..Default::default()
        };
        let mut stored = sealer(b"right").seal(&msg).await.unwrap();
        let err = sealer(b"wrong").open(&mut stored).await.unwrap_err();
        assert!(matches!(err, SixinError::Crypto(CryptoError::Decryption)));
    }
}
