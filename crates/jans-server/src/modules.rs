//! Built-in native script modules.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jans_ldap::{ldap_escape, DirectoryPools, LdapError, PoolRole, SearchScope};
use jans_script::{
    ExternalScriptContext, NativeScriptFactory, ScriptError, ScriptModule, ScriptResult,
    ScriptServices, ScriptSignal, StopResult,
};

/// Module name of [`DirectoryBindAuthenticator`].
pub const DIRECTORY_BIND: &str = "directory-bind";

const INVALID_CREDENTIALS: &str = "invalid credentials";

/// Registers every built-in module with `factory`.
pub fn register_builtin(factory: &NativeScriptFactory) {
    factory.register(DIRECTORY_BIND, |_, services: &ScriptServices| {
        Box::new(DirectoryBindAuthenticator::new(services.directory.clone()))
    });
}

/// Password check against the directory.
///
/// Finds the user entry on the primary general pool, then binds as that entry
/// on the primary auth pool. Properties:
///
/// - `user_base`: search base (default `ou=people,o=jans`)
/// - `uid_attribute`: attribute matched against the principal (default `uid`)
/// - `return_attributes`: comma-separated attributes copied into the result
#[derive(Debug)]
pub struct DirectoryBindAuthenticator {
    directory: Option<Arc<DirectoryPools>>,
    user_base: String,
    uid_attribute: String,
    return_attributes: Vec<String>,
}

impl DirectoryBindAuthenticator {
    /// Creates the module over `directory`.
    #[must_use]
    pub fn new(directory: Option<Arc<DirectoryPools>>) -> Self {
        Self {
            directory,
            user_base: "ou=people,o=jans".to_string(),
            uid_attribute: "uid".to_string(),
            return_attributes: vec!["mail".to_string(), "displayName".to_string()],
        }
    }

    fn directory(&self) -> ScriptResult<&DirectoryPools> {
        self.directory
            .as_deref()
            .ok_or_else(|| ScriptError::Initialization("no directory configured".to_string()))
    }

    async fn find_user(
        &self,
        directory: &DirectoryPools,
        principal: &str,
    ) -> Result<Option<jans_ldap::DirectoryEntry>, LdapError> {
        let filter = format!("({}={})", self.uid_attribute, ldap_escape(principal));
        let mut attributes: Vec<&str> = self.return_attributes.iter().map(String::as_str).collect();
        attributes.push(self.uid_attribute.as_str());

        let mut conn = directory.primary(PoolRole::General)?.acquire().await?;
        match conn
            .search(&self.user_base, SearchScope::Subtree, &filter, &attributes)
            .await
        {
            Ok(entries) => {
                conn.release(true).await;
                Ok(entries.into_iter().next())
            }
            Err(err) => {
                conn.release(!err.is_connection_error()).await;
                Err(err)
            }
        }
    }

    async fn verify_password(
        &self,
        directory: &DirectoryPools,
        dn: &str,
        password: &str,
    ) -> Result<bool, LdapError> {
        let pool = directory
            .primary(PoolRole::Auth)
            .or_else(|_| directory.primary(PoolRole::General))?;
        let mut conn = pool.acquire().await?;
        let bound = conn.bind(dn, password).await;
        // The connection is no longer bound as the service account.
        conn.discard().await;
        match bound {
            Err(LdapError::InvalidCredentials) => Ok(false),
            other => other,
        }
    }
}

#[async_trait]
impl ScriptModule for DirectoryBindAuthenticator {
    async fn initialize(&mut self, properties: &BTreeMap<String, String>) -> ScriptResult<()> {
        self.directory()?;
        if let Some(base) = properties.get("user_base") {
            self.user_base = base.clone();
        }
        if let Some(attr) = properties.get("uid_attribute") {
            if attr.trim().is_empty() {
                return Err(ScriptError::Initialization(
                    "uid_attribute cannot be empty".to_string(),
                ));
            }
            self.uid_attribute = attr.trim().to_string();
        }
        if let Some(list) = properties.get("return_attributes") {
            self.return_attributes = list
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    async fn invoke(
        &self,
        method: &str,
        ctx: &mut ExternalScriptContext,
    ) -> ScriptResult<ScriptSignal> {
        if method != "authenticate" {
            return Ok(ScriptSignal::Continue);
        }
        let (principal, password) = match (ctx.principal(), ctx.credential()) {
            (Some(p), Some(c)) if !p.is_empty() && !c.is_empty() => (p.to_string(), c.to_string()),
            _ => return Ok(ScriptSignal::Stop(StopResult::deny("missing credentials"))),
        };

        let directory = self.directory()?;
        let Some(entry) = self.find_user(directory, &principal).await? else {
            tracing::debug!(principal = %principal, "no directory entry for principal");
            return Ok(ScriptSignal::Stop(StopResult::deny(INVALID_CREDENTIALS)));
        };

        if !self.verify_password(directory, &entry.dn, &password).await? {
            return Ok(ScriptSignal::Stop(StopResult::deny(INVALID_CREDENTIALS)));
        }

        ctx.set_result("dn", entry.dn.clone());
        for attr in &self.return_attributes {
            if let Some(value) = entry.get_attr(attr) {
                ctx.set_result(attr.clone(), value.to_string());
            }
        }
        Ok(ScriptSignal::Success)
    }
}
