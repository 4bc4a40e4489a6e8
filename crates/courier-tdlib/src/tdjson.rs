//! TDLib JSON request builders and response readers.

use std::time::Duration;

use courier_core::{
    domain::{MediaKind, SessionState},
    Error,
};
use serde_json::{json, Value};

/// Bot API message ids are TDLib message ids shifted by 20 bits.
const MESSAGE_ID_SHIFT: i64 = 1 << 20;

pub fn to_tdlib_message_id(bot_api_id: i64) -> i64 {
    bot_api_id * MESSAGE_ID_SHIFT
}

/// Map a TDLib `error` object to the core error taxonomy.
pub fn classify_error(code: i64, message: &str) -> Error {
    let upper = message.to_uppercase();

    if code == 429 || upper.starts_with("FLOOD_WAIT") || upper.contains("TOO MANY REQUESTS") {
        return Error::TransientSend {
            reason: message.to_string(),
            retry_after: retry_after_secs(message).map(Duration::from_secs),
        };
    }
    if code == 401
        || upper.contains("AUTH_KEY_UNREGISTERED")
        || upper.contains("SESSION_REVOKED")
        || upper.contains("USER_DEACTIVATED")
    {
        return Error::ProviderUnavailable(message.to_string());
    }
    if upper.contains("USERNAME_NOT_OCCUPIED")
        || upper.contains("USERNAME_INVALID")
        || upper.contains("PEER_ID_INVALID")
        || upper.contains("USER NOT FOUND")
    {
        return Error::IdentityUnresolvable(message.to_string());
    }
    if code >= 500 || code == 420 {
        return Error::transient(format!("tdlib {code}: {message}"));
    }
    Error::External(format!("tdlib {code}: {message}"))
}

/// Whether a send error means the secret chat layer refused this media type.
pub fn is_media_rejection(message: &str) -> bool {
    let upper = message.to_uppercase();
    upper.contains("MEDIA_INVALID")
        || upper.contains("MEDIA_EMPTY")
        || upper.contains("FILE_PART")
        || upper.contains("CAN'T SEND")
}

/// Extract `N` from "FLOOD_WAIT_N" or "retry after N".
fn retry_after_secs(message: &str) -> Option<u64> {
    let lower = message.to_lowercase();
    let tail = if let Some(rest) = lower.strip_prefix("flood_wait_") {
        rest
    } else {
        lower.split("retry after ").nth(1)?
    };
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Error object in a TDLib response, if any.
pub fn response_error(v: &Value) -> Option<(i64, String)> {
    if v.get("@type").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let code = v.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = v
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Some((code, message))
}

/// Active username of a `user` object, falling back to the first name.
pub fn user_display_name(user: &Value) -> Option<String> {
    user.pointer("/usernames/active_usernames/0")
        .or_else(|| user.get("username"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| user.get("first_name").and_then(Value::as_str))
        .map(|s| s.to_string())
}

pub fn secret_chat_state(v: &Value) -> Option<SessionState> {
    match v.pointer("/state/@type").and_then(Value::as_str)? {
        "secretChatStatePending" => Some(SessionState::Pending),
        "secretChatStateReady" => Some(SessionState::Ready),
        "secretChatStateClosed" => Some(SessionState::Closed),
        _ => None,
    }
}

/// Session handles encode `<chat_id>:<secret_chat_id>`.
pub fn encode_session(chat_id: i64, secret_chat_id: i64) -> String {
    format!("{chat_id}:{secret_chat_id}")
}

pub fn decode_session(handle: &str) -> Option<(i64, i64)> {
    let (chat, secret) = handle.split_once(':')?;
    Some((chat.parse().ok()?, secret.parse().ok()?))
}

pub fn text_content(text: &str) -> Value {
    json!({
        "@type": "inputMessageText",
        "text": { "@type": "formattedText", "text": text },
    })
}

pub fn media_content(kind: MediaKind, remote_path: &str, filename: &str) -> Value {
    let file = json!({ "@type": "inputFileLocal", "path": remote_path });
    match kind {
        MediaKind::Photo => json!({ "@type": "inputMessagePhoto", "photo": file }),
        MediaKind::Video => json!({
            "@type": "inputMessageVideo",
            "video": file,
            "supports_streaming": true,
        }),
        MediaKind::Document => json!({
            "@type": "inputMessageDocument",
            "document": file,
            "caption": { "@type": "formattedText", "text": filename },
        }),
    }
}

pub fn admin_rights() -> Value {
    json!({
        "@type": "chatMemberStatusAdministrator",
        "rights": {
            "@type": "chatAdministratorRights",
            "can_post_messages": true,
            "can_edit_messages": true,
            "can_delete_messages": true,
        },
    })
}

/// Downloadable file of a channel message: (file id, kind, file name).
pub fn message_file(message: &Value) -> Option<(i64, MediaKind, String)> {
    let content = message.get("content")?;
    match content.get("@type").and_then(Value::as_str)? {
        "messagePhoto" => {
            let sizes = content.pointer("/photo/sizes")?.as_array()?;
            let id = sizes.last()?.pointer("/photo/id")?.as_i64()?;
            Some((id, MediaKind::Photo, format!("photo_{id}.jpg")))
        }
        "messageVideo" => {
            let video = content.get("video")?;
            let id = video.pointer("/video/id")?.as_i64()?;
            let name = file_name_or(video, || format!("video_{id}.mp4"));
            Some((id, MediaKind::Video, name))
        }
        "messageDocument" => {
            let doc = content.get("document")?;
            let id = doc.pointer("/document/id")?.as_i64()?;
            let name = file_name_or(doc, || format!("document_{id}"));
            Some((id, MediaKind::Document, name))
        }
        _ => None,
    }
}

fn file_name_or(v: &Value, fallback: impl FnOnce() -> String) -> String {
    v.get("file_name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::errors::ErrorKind;

    #[test]
    fn flood_wait_is_transient_with_delay() {
        let err = classify_error(429, "Too Many Requests: retry after 7");
        assert_eq!(err.kind(), ErrorKind::TransientSendFailure);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = classify_error(420, "FLOOD_WAIT_12");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn auth_failures_are_provider_unavailable() {
        assert_eq!(
            classify_error(401, "Unauthorized").kind(),
            ErrorKind::ProviderUnavailable
        );
        assert_eq!(
            classify_error(400, "AUTH_KEY_UNREGISTERED").kind(),
            ErrorKind::ProviderUnavailable
        );
    }

    #[test]
    fn lookup_failures_are_unresolvable() {
        assert_eq!(
            classify_error(400, "USERNAME_NOT_OCCUPIED").kind(),
            ErrorKind::IdentityUnresolvable
        );
        assert_eq!(
            classify_error(400, "CHAT_ADMIN_REQUIRED").kind(),
            ErrorKind::External
        );
    }

    #[test]
    fn reads_secret_chat_state_and_handles() {
        let v = json!({"@type": "secretChat", "state": {"@type": "secretChatStateReady"}});
        assert_eq!(secret_chat_state(&v), Some(SessionState::Ready));
        assert_eq!(decode_session(&encode_session(-5, 77)), Some((-5, 77)));
        assert_eq!(decode_session("garbage"), None);
    }

    #[test]
    fn display_name_prefers_active_username() {
        let v = json!({"usernames": {"active_usernames": ["courier_a"]}, "first_name": "A"});
        assert_eq!(user_display_name(&v).as_deref(), Some("courier_a"));
        let v = json!({"first_name": "Anna"});
        assert_eq!(user_display_name(&v).as_deref(), Some("Anna"));
    }

    #[test]
    fn picks_largest_photo_and_video_name() {
        let photo = json!({"content": {"@type": "messagePhoto", "photo": {"sizes": [
            {"photo": {"id": 1}}, {"photo": {"id": 2}}
        ]}}});
        assert_eq!(
            message_file(&photo),
            Some((2, MediaKind::Photo, "photo_2.jpg".to_string()))
        );

        let video = json!({"content": {"@type": "messageVideo", "video": {
            "file_name": "clip.mp4", "video": {"id": 9}
        }}});
        assert_eq!(
            message_file(&video),
            Some((9, MediaKind::Video, "clip.mp4".to_string()))
        );
    }

    #[test]
    fn bot_api_ids_are_shifted() {
        assert_eq!(to_tdlib_message_id(3), 3 * 1_048_576);
    }
}
