//! Static route-to-permission table. Built once at startup and handed to the
//! HTTP layer by reference; request-time lookups key on the registered route
//! template (method plus path pattern), never on the live request URI.

use std::collections::HashMap;

use axum::http::Method;

use super::permission::Permission;

pub struct PermissionRegistry {
    table: HashMap<(Method, String), &'static [Permission]>,
}

impl PermissionRegistry {
    /// The full permission map for the service's gated operations.
    pub fn with_defaults() -> Self {
        use Permission::*;
        let mut reg = Self { table: HashMap::new() };

        reg.register(Method::PATCH, "/api/qpoints/discord/add", &[DiscordManage]);
        reg.register(Method::PATCH, "/api/qpoints/discord/remove", &[DiscordManage]);
        reg.register(Method::PATCH, "/api/qpoints/discord/set", &[DiscordManage]);
        reg.register(Method::PATCH, "/api/qpoints/discord/transfer/{from}/{to}", &[DiscordManage]);
        reg.register(Method::GET, "/api/qpoints/discord/{user}", &[DiscordRead]);

        reg.register(Method::PATCH, "/api/qpoints/twitch/add", &[TwitchManage]);
        reg.register(Method::PATCH, "/api/qpoints/twitch/remove", &[TwitchManage]);
        reg.register(Method::PATCH, "/api/qpoints/twitch/set", &[TwitchManage]);
        reg.register(Method::PATCH, "/api/qpoints/twitch/transfer/{from}/{to}", &[TwitchManage]);
        reg.register(Method::GET, "/api/qpoints/twitch/{user}", &[TwitchRead]);

        reg.register(Method::PATCH, "/api/qpoints/link/{twitch}/{discord}", &[LinkPlatforms]);
        reg.register(Method::GET, "/api/qpoints/top10", &[ReadMultiple]);
        reg.register(Method::GET, "/api/qpoints/all-users", &[ReadMultiple]);
        reg.register(Method::DELETE, "/api/qpoints", &[ResetBalances]);

        reg.register(Method::POST, "/api/admin/keys", &[ManageKeys]);

        reg
    }

    pub fn register(&mut self, method: Method, path: &str, required: &'static [Permission]) {
        self.table.insert((method, path.to_string()), required);
    }

    /// Permissions required for the exact registered operation, or None when
    /// the operation is not in the table (callers fail closed on None).
    pub fn required_for(&self, method: &Method, path: &str) -> Option<&'static [Permission]> {
        self.table.get(&(method.clone(), path.to_string())).copied()
    }

    pub fn len(&self) -> usize { self.table.len() }

    pub fn is_empty(&self) -> bool { self.table.is_empty() }
}
