//! Проверка учётных данных клиентов и маршрутов.
//!
//! Секрет в конфигурации может быть задан открытым текстом или хешем
//! argon2 (`$argon2id$...`), полученным через [`hash_password`].

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use nexum_error::SessionError;
use rand::rngs::OsRng;
use thiserror::Error;

const ARGON2_PREFIX: &str = "$argon2";

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Password hashing failed")]
    Hash,
    #[error("Password verification failed")]
    Verify,
}

/// Учётные данные, которые должна предъявить удалённая сторона.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    user: Option<String>,
    pass: Option<String>,
    token: Option<String>,
}

/// Учётные данные из CONNECT.
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials<'a> {
    pub user: Option<&'a str>,
    pub pass: Option<&'a str>,
    pub token: Option<&'a str>,
}

impl Authenticator {
    pub fn new(
        user: Option<String>,
        pass: Option<String>,
        token: Option<String>,
    ) -> Self {
        Self { user, pass, token }
    }

    /// Без настроенных учётных данных пускаем всех.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn required(&self) -> bool {
        self.user.is_some() || self.token.is_some()
    }

    /// Проверяет предъявленные учётные данные.
    ///
    /// Токен имеет приоритет над парой user/pass.
    pub fn check(
        &self,
        creds: Credentials<'_>,
    ) -> Result<(), SessionError> {
        if let Some(token) = &self.token {
            return match creds.token {
                Some(given) if secret_matches(token, given) => Ok(()),
                _ => Err(SessionError::AuthorizationViolation),
            };
        }

        if let Some(user) = &self.user {
            let user_ok = creds.user == Some(user.as_str());
            let pass_ok = match (&self.pass, creds.pass) {
                (Some(expected), Some(given)) => secret_matches(expected, given),
                (None, _) => true,
                (Some(_), None) => false,
            };
            if !(user_ok && pass_ok) {
                return Err(SessionError::AuthorizationViolation);
            }
        }
        Ok(())
    }
}

fn secret_matches(
    expected: &str,
    given: &str,
) -> bool {
    if expected.starts_with(ARGON2_PREFIX) {
        return verify_password(expected, given).unwrap_or(false);
    }
    constant_time_eq(expected.as_bytes(), given.as_bytes())
}

fn constant_time_eq(
    a: &[u8],
    b: &[u8],
) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Хеширует пароль для хранения в конфигурации.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let params = Params::new(15_000, 2, 1, None).map_err(|_| PasswordError::Hash)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| PasswordError::Hash)
}

pub fn verify_password(
    hash: &str,
    password: &str,
) -> Result<bool, PasswordError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| PasswordError::Verify)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds<'a>(
        user: Option<&'a str>,
        pass: Option<&'a str>,
        token: Option<&'a str>,
    ) -> Credentials<'a> {
        Credentials { user, pass, token }
    }

    #[test]
    fn test_open_accepts_anything() {
        let auth = Authenticator::open();
        assert!(!auth.required());
        assert!(auth.check(Credentials::default()).is_ok());
    }

    #[test]
    fn test_user_password() {
        let auth = Authenticator::new(Some("derek".into()), Some("s3cr3t".into()), None);
        assert!(auth.required());
        assert!(auth.check(creds(Some("derek"), Some("s3cr3t"), None)).is_ok());
        assert_eq!(
            auth.check(creds(Some("derek"), Some("wrong"), None)),
            Err(SessionError::AuthorizationViolation)
        );
        assert!(auth.check(creds(Some("derek"), None, None)).is_err());
        assert!(auth.check(creds(None, None, None)).is_err());
    }

    #[test]
    fn test_token() {
        let auth = Authenticator::new(None, None, Some("T0K3N".into()));
        assert!(auth.check(creds(None, None, Some("T0K3N"))).is_ok());
        assert!(auth.check(creds(Some("x"), Some("y"), None)).is_err());
    }

    /// Тест проверяет пароль, заданный хешем argon2.
    #[test]
    fn test_hashed_password() {
        let hash = hash_password("my_secret_password").expect("Hashing should succeed");
        let auth = Authenticator::new(Some("u".into()), Some(hash), None);
        assert!(auth.check(creds(Some("u"), Some("my_secret_password"), None)).is_ok());
        assert!(auth.check(creds(Some("u"), Some("wrong_password"), None)).is_err());
    }

    #[test]
    fn test_verify_invalid_hash() {
        assert!(
            verify_password("invalid_hash", "password").is_err(),
            "An invalid hash should return an error"
        );
    }
}
