//! Accounts returned by authorization and the session's auth state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::frame::flag;

/// One account linked to the authorizing token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    /// "fiat" or "crypto"
    #[serde(default)]
    pub currency_type: String,
    #[serde(default, deserialize_with = "flag")]
    pub is_virtual: bool,
}

impl Account {
    /// Real-money account in a fiat currency.
    pub fn is_real_fiat(&self) -> bool {
        !self.is_virtual && self.currency_type == "fiat"
    }
}

/// Pick the first account matching `predicate`.
///
/// Ties are broken by the order of `accounts`, which callers must keep stable
/// (the server's `account_list` order).
pub fn select_account<P>(accounts: &[Account], predicate: P) -> Option<&Account>
where
    P: Fn(&Account) -> bool,
{
    accounts.iter().find(|account| predicate(account))
}

/// Authentication state of a session, set once by a successful authorization.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthState {
    pub token: String,
    pub login_id: String,
    pub currency: String,
    pub is_virtual: bool,
    pub accounts: Vec<Account>,
    pub authenticated: bool,
}

impl AuthState {
    /// First real fiat account, in server order.
    pub fn real_fiat_account(&self) -> Option<&Account> {
        select_account(&self.accounts, Account::is_real_fiat)
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("token", &"<redacted>")
            .field("login_id", &self.login_id)
            .field("currency", &self.currency)
            .field("is_virtual", &self.is_virtual)
            .field("accounts", &self.accounts.len())
            .field("authenticated", &self.authenticated)
            .finish()
    }
}
