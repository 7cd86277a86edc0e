//! Session and token management: resolve the console user and derive their
//! environment and data directory.

use std::path::PathBuf;

use tracing::debug;

use crate::env::EnvironmentBlock;
use crate::os::handle::OwnedHandle;
use crate::os::{env as os_env, session, Win32Error};
use crate::{HostRole, PRODUCT};

/// A user's primary access token, or the sentinel for "no interactive user".
///
/// The sentinel is an ordinary value, not an error: it is the expected
/// outcome at the lock screen and before first logon.
#[derive(Debug)]
pub struct Token {
    handle: Option<OwnedHandle>,
}

impl Token {
    /// The "no interactive user" sentinel.
    #[must_use]
    pub const fn none() -> Self {
        Self { handle: None }
    }

    /// Whether this is the "no interactive user" sentinel.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.handle.is_none()
    }

    /// Raw handle for OS calls; the sentinel maps to the null token, which
    /// create-process-as-user treats as "the current user".
    #[must_use]
    pub fn raw(&self) -> windows_sys::Win32::Foundation::HANDLE {
        self.handle.as_ref().map_or(0, OwnedHandle::raw)
    }
}

impl From<OwnedHandle> for Token {
    fn from(handle: OwnedHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

/// Errors from data-directory derivation.
#[derive(Debug, thiserror::Error)]
pub enum UserDirError {
    /// The token's environment block could not be fetched.
    #[error(transparent)]
    System(#[from] Win32Error),

    /// The environment block has no `APPDATA` variable to anchor on.
    #[error("user environment has no APPDATA variable")]
    NoAppData,
}

/// Resolves the interactive user's token, environment, and data directory.
///
/// The role decides where tokens come from: a service queries the active
/// console session, a foreground host simply duplicates its own token.
#[derive(Debug, Clone, Copy)]
pub struct SessionTokens {
    role: HostRole,
}

impl SessionTokens {
    /// Create a resolver for the given host role.
    #[must_use]
    pub const fn new(role: HostRole) -> Self {
        Self { role }
    }

    /// The primary token of the console user, or the sentinel when nobody
    /// is logged on interactively.
    ///
    /// # Errors
    ///
    /// Returns the last-error code on unexpected token-query failures; the
    /// soft outcomes documented on [`session::query_user_token`] come back
    /// as `Token::none()`.
    pub fn current_user_token(&self) -> Result<Token, Win32Error> {
        if !self.role.is_service() {
            return session::current_process_token().map(Token::from);
        }
        let Some(session_id) = session::active_console_session_id() else {
            debug!("no session attached to the console");
            return Ok(Token::none());
        };
        match session::query_user_token(session_id)? {
            Some(handle) => Ok(Token::from(handle)),
            None => Ok(Token::none()),
        }
    }

    /// Whether an interactive user is currently logged on.
    ///
    /// The token acquired for the check is dropped before returning.
    #[must_use]
    pub fn is_user_logged_on(&self) -> bool {
        self.current_user_token()
            .map(|token| !token.is_none())
            .unwrap_or(false)
    }

    /// The environment block for `token`'s user.
    ///
    /// # Errors
    ///
    /// Returns the last-error code if the block cannot be created.
    pub fn environment_for(&self, token: &Token) -> Result<EnvironmentBlock, Win32Error> {
        let block = os_env::environment_block_for(token.raw())?;
        Ok(EnvironmentBlock::from_wide_block(&block))
    }

    /// The per-user data directory: `%APPDATA%\gpii`, taken from the
    /// *token's* environment.
    ///
    /// The service's own environment is deliberately never consulted; under
    /// LocalSystem it would point at the system profile.
    ///
    /// # Errors
    ///
    /// Returns [`UserDirError::NoAppData`] if the block lacks `APPDATA`.
    pub fn user_data_dir(&self, token: &Token) -> Result<PathBuf, UserDirError> {
        let env = self.environment_for(token)?;
        let appdata = env.get("APPDATA").ok_or(UserDirError::NoAppData)?;
        Ok(PathBuf::from(appdata).join(PRODUCT))
    }
}
