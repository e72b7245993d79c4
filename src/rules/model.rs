//! Rule and work-group types.

use std::collections::HashMap;

use secrecy::SecretString;
use serde::Deserialize;
use uuid::Uuid;

/// A rule as persisted by the rule store. The password is held as a secret
/// from the moment it is parsed.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleRecord {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub user: String,
    pub password: SecretString,
    pub mail_server: String,
    pub source: String,
    pub target: String,
}

/// A routing instruction: mail in `source_folder` from senders already
/// present in `target_folder` is moved to `target_folder`.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: Uuid,
    pub user: String,
    pub credential: SecretString,
    pub mail_server: String,
    pub source_folder: String,
    pub target_folder: String,
}

impl Rule {
    pub fn new(
        user: impl Into<String>,
        credential: impl Into<String>,
        mail_server: impl Into<String>,
        source_folder: impl Into<String>,
        target_folder: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: user.into(),
            credential: SecretString::from(credential.into()),
            mail_server: mail_server.into(),
            source_folder: source_folder.into(),
            target_folder: target_folder.into(),
        }
    }

    /// Whether two rules route the same folders for the same user.
    pub fn same_route(&self, other: &Rule) -> bool {
        self.user == other.user
            && self.source_folder == other.source_folder
            && self.target_folder == other.target_folder
    }

    /// Connection details for this rule's mailbox.
    pub fn account(&self) -> Account {
        Account {
            user: self.user.clone(),
            mail_server: self.mail_server.clone(),
            credential: self.credential.clone(),
        }
    }
}

impl From<RuleRecord> for Rule {
    fn from(record: RuleRecord) -> Self {
        Self {
            id: record.id.unwrap_or_else(Uuid::new_v4),
            user: record.user,
            credential: record.password,
            mail_server: record.mail_server,
            source_folder: record.source,
            target_folder: record.target,
        }
    }
}

/// One mailbox identity.
#[derive(Debug, Clone)]
pub struct Account {
    pub user: String,
    pub mail_server: String,
    pub credential: SecretString,
}

/// All rules for one account, processed by one worker over one session.
#[derive(Debug, Clone)]
pub struct WorkGroup {
    pub account: Account,
    pub rules: Vec<Rule>,
}

impl WorkGroup {
    pub fn user(&self) -> &str {
        &self.account.user
    }

    /// Partition rules by user.
    ///
    /// Groups come out in the order their user first appears; rules keep
    /// their input order within a group.
    pub fn partition(rules: Vec<Rule>) -> Vec<WorkGroup> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<WorkGroup> = Vec::new();

        for rule in rules {
            match index.get(&rule.user) {
                Some(&i) => {
                    let group = &mut groups[i];
                    if group.account.mail_server != rule.mail_server {
                        tracing::warn!(
                            user = %rule.user,
                            expected = %group.account.mail_server,
                            found = %rule.mail_server,
                            "Rule names a different mail server than the account's first rule; using the first"
                        );
                    }
                    group.rules.push(rule);
                }
                None => {
                    index.insert(rule.user.clone(), groups.len());
                    groups.push(WorkGroup {
                        account: rule.account(),
                        rules: vec![rule],
                    });
                }
            }
        }

        tracing::debug!(
            accounts = groups.len(),
            users = ?groups.iter().map(WorkGroup::user).collect::<Vec<_>>(),
            "Partitioned rules"
        );
        groups
    }
}
