//! Account registry: ordered sender accounts and the lookups over them.

use once_cell::sync::OnceCell;

use crate::config::MailAccount;
use crate::errors::{DispatchError, DispatchResult};
use crate::types::Address;

/// Read-only view over the configured accounts.
///
/// When no account is configured, a single placeholder account is
/// materialized on first access so lookups never see an empty store.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: Vec<MailAccount>,
    placeholder: OnceCell<Vec<MailAccount>>,
}

impl AccountRegistry {
    /// Creates a registry over `accounts`, kept in configuration order.
    pub fn new(accounts: Vec<MailAccount>) -> Self {
        Self {
            accounts,
            placeholder: OnceCell::new(),
        }
    }

    /// Every record, configured or placeholder.
    pub fn records(&self) -> &[MailAccount] {
        if !self.accounts.is_empty() {
            return &self.accounts;
        }

        self.placeholder.get_or_init(|| {
            tracing::warn!(
                host = crate::config::PLACEHOLDER_HOST,
                "No mail accounts configured; using placeholder account"
            );
            vec![MailAccount::placeholder()]
        })
    }

    /// Returns true if the registry only holds the placeholder.
    pub fn is_unconfigured(&self) -> bool {
        self.accounts.is_empty()
    }

    /// The enabled default account, else the first enabled account.
    pub fn find_default(&self) -> DispatchResult<&MailAccount> {
        let records = self.records();
        records
            .iter()
            .find(|a| a.enabled && a.is_default)
            .or_else(|| records.iter().find(|a| a.enabled))
            .ok_or_else(|| DispatchError::configuration("no usable account"))
    }

    /// Every enabled account, default-flagged ones first, otherwise in
    /// configuration order.
    pub fn find_all_enabled(&self) -> Vec<&MailAccount> {
        let mut enabled: Vec<&MailAccount> = self.records().iter().filter(|a| a.enabled).collect();
        enabled.sort_by_key(|a| !a.is_default);
        enabled
    }

    /// Looks up an account by its exact code.
    pub fn find_by_code(&self, code: &str) -> Option<&MailAccount> {
        self.records().iter().find(|a| a.code == code)
    }

    /// Enabled accounts whose domain filter covers the recipient, in
    /// [`find_all_enabled`](Self::find_all_enabled) order.
    pub fn find_for_recipient(&self, recipient: &Address) -> Vec<&MailAccount> {
        let domain = recipient.domain();
        self.find_all_enabled()
            .into_iter()
            .filter(|a| a.serves_domain(domain))
            .collect()
    }
}
