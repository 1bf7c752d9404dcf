// 登录校验：按 ID 查询存储的密码并与提交值比较，成功后把 ID 写入会话。
use crate::envelope::{error_envelope, ok_envelope, Envelope};
use crate::executor::{ParamType, QueryExecutor};
use crate::session::SessionStore;
use tracing::{info, warn};

pub const SESSION_USER_KEY: &str = "id";
pub const LOGIN_FAILED_MESSAGE: &str = "Username/password incorrect";
pub const NOT_LOGGED_IN_MESSAGE: &str = "Not logged in";

const PASSWORD_QUERY: &str = "select password from Instructor where ID = ?";

/// 查无此人与密码错误返回同一个错误信封，调用方无法区分。
pub fn login(
    executor: &QueryExecutor,
    session: &dyn SessionStore,
    userid: Option<&str>,
    password: Option<&str>,
) -> Envelope {
    let (Some(userid), Some(password)) = (userid, password) else {
        return error_envelope(LOGIN_FAILED_MESSAGE);
    };
    let rows = match executor.execute_query_list(
        PASSWORD_QUERY,
        &[ParamType::String],
        &[userid.into()],
    ) {
        Ok(rows) => rows,
        Err(err) => return error_envelope(err.message()),
    };
    let stored = rows
        .first()
        .and_then(|row| row.first())
        .and_then(|value| value.as_text());
    if stored == Some(password) {
        session.set(SESSION_USER_KEY, userid);
        info!("用户登录成功: {userid}");
        ok_envelope()
    } else {
        warn!("用户登录失败: {userid}");
        error_envelope(LOGIN_FAILED_MESSAGE)
    }
}

pub fn login_status(session: &dyn SessionStore) -> Envelope {
    if session.get(SESSION_USER_KEY).is_some() {
        ok_envelope()
    } else {
        error_envelope(NOT_LOGGED_IN_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;
    use crate::storage::{Connector, SqliteConnector};
    use std::sync::Arc;

    fn executor_with_instructor() -> (tempfile::TempDir, QueryExecutor) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("auth.db");
        let connector = SqliteConnector::new(path.to_str().expect("utf-8 path"));
        let mut conn = connector.connect().expect("open sqlite");
        conn.update(
            "CREATE TABLE Instructor (ID VARCHAR(5) PRIMARY KEY, name VARCHAR(20), password VARCHAR(20))",
            &[],
        )
        .expect("create table");
        conn.update(
            "INSERT INTO Instructor (ID, name, password) VALUES ('alice', 'Alice', 'secret')",
            &[],
        )
        .expect("seed");
        drop(conn);
        (dir, QueryExecutor::new(Arc::new(connector)))
    }

    #[test]
    fn matching_password_records_session() {
        let (_dir, executor) = executor_with_instructor();
        let session = MemorySession::default();
        let envelope = login(&executor, &session, Some("alice"), Some("secret"));
        assert_eq!(envelope, ok_envelope());
        assert_eq!(session.get(SESSION_USER_KEY).as_deref(), Some("alice"));
        assert_eq!(login_status(&session), ok_envelope());
    }

    #[test]
    fn wrong_password_and_unknown_user_are_indistinguishable() {
        let (_dir, executor) = executor_with_instructor();
        let session = MemorySession::default();
        let wrong = login(&executor, &session, Some("alice"), Some("wrong"));
        let unknown = login(&executor, &session, Some("bob"), Some("x"));
        assert_eq!(wrong, error_envelope(LOGIN_FAILED_MESSAGE));
        assert_eq!(wrong, unknown);
        assert!(session.get(SESSION_USER_KEY).is_none());
        assert_eq!(login_status(&session), error_envelope(NOT_LOGGED_IN_MESSAGE));
    }

    #[test]
    fn missing_fields_never_match() {
        let (_dir, executor) = executor_with_instructor();
        let session = MemorySession::default();
        assert_eq!(
            login(&executor, &session, Some("alice"), None),
            error_envelope(LOGIN_FAILED_MESSAGE)
        );
        assert_eq!(
            login(&executor, &session, None, Some("secret")),
            error_envelope(LOGIN_FAILED_MESSAGE)
        );
    }

    #[test]
    fn database_errors_surface_raw_message() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("empty.db");
        let executor = QueryExecutor::new(Arc::new(SqliteConnector::new(
            path.to_str().expect("utf-8 path"),
        )));
        let session = MemorySession::default();
        let envelope = login(&executor, &session, Some("alice"), Some("secret"));
        assert!(!envelope.status);
        assert!(envelope
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("no such table"));
    }
}
