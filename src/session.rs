// 会话存储：内存中的 cookie 会话，处理器只通过 SessionStore 的 get/set 访问。
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "session_id";

/// 由 HTTP 层提供的会话能力。
pub trait SessionStore: Send + Sync {
    fn set(&self, key: &str, value: &str);
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Default)]
pub struct MemorySession {
    attributes: Mutex<HashMap<String, String>>,
}

impl SessionStore for MemorySession {
    fn set(&self, key: &str, value: &str) {
        self.attributes
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    fn get(&self, key: &str) -> Option<String> {
        self.attributes.lock().get(key).cloned()
    }
}

pub struct ResolvedSession {
    pub id: String,
    pub session: Arc<MemorySession>,
    /// 请求未携带有效 cookie，会话尚未登记。
    pub created: bool,
    issue_cookie: bool,
}

impl ResolvedSession {
    /// 会话本次刚登记时需要回写的 Set-Cookie 头。
    pub fn set_cookie_header(&self) -> Option<HeaderValue> {
        if !self.issue_cookie {
            return None;
        }
        HeaderValue::from_str(&format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly",
            self.id
        ))
        .ok()
    }

    pub fn apply_cookie(&self, headers: &mut HeaderMap) {
        if let Some(value) = self.set_cookie_header() {
            headers.insert(SET_COOKIE, value);
        }
    }
}

/// 只保存登录成功过的会话；匿名请求拿到的临时会话不入表。
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<MemorySession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 cookie 找到已登记的会话，找不到时给出一个未登记的临时会话。
    pub fn resolve(&self, headers: &HeaderMap) -> ResolvedSession {
        if let Some(id) = extract_session_id(headers) {
            if let Some(session) = self.sessions.get(&id) {
                return ResolvedSession {
                    id,
                    session: session.value().clone(),
                    created: false,
                    issue_cookie: false,
                };
            }
        }
        ResolvedSession {
            id: Uuid::new_v4().simple().to_string(),
            session: Arc::new(MemorySession::default()),
            created: true,
            issue_cookie: false,
        }
    }

    /// 登记临时会话并在响应里下发 cookie；已登记的会话不重复下发。
    pub fn persist(&self, resolved: &mut ResolvedSession) {
        if !resolved.created {
            return;
        }
        self.sessions
            .insert(resolved.id.clone(), resolved.session.clone());
        resolved.created = false;
        resolved.issue_cookie = true;
    }

    pub fn get(&self, id: &str) -> Option<Arc<MemorySession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

pub fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|text| text.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_value_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; session_id=abc123"),
        );
        assert_eq!(extract_session_id(&headers).as_deref(), Some("abc123"));
        assert_eq!(extract_session_id(&HeaderMap::new()), None);
    }

    #[test]
    fn registry_reuses_persisted_sessions() {
        let registry = SessionRegistry::new();
        let mut first = registry.resolve(&HeaderMap::new());
        assert!(first.created);
        assert!(first.set_cookie_header().is_none());
        first.session.set("id", "alice");
        registry.persist(&mut first);
        assert!(first.set_cookie_header().is_some());

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE}={}", first.id)).expect("cookie"),
        );
        let mut second = registry.resolve(&headers);
        assert!(!second.created);
        registry.persist(&mut second);
        assert!(second.set_cookie_header().is_none());
        assert_eq!(second.session.get("id").as_deref(), Some("alice"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn anonymous_requests_are_not_registered() {
        let registry = SessionRegistry::new();
        for _ in 0..100 {
            let resolved = registry.resolve(&HeaderMap::new());
            assert!(resolved.set_cookie_header().is_none());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_cookie_starts_a_new_session() {
        let registry = SessionRegistry::new();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session_id=stale"));
        let resolved = registry.resolve(&headers);
        assert!(resolved.created);
        assert_ne!(resolved.id, "stale");
    }
}
