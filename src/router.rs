use crate::{
    config::RouteConfig,
    error::{GatewayError, GatewayResult},
    identity::Plan,
};

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub prefix: String,
    pub product: String,
    pub backend_url: String,
    pub plans: Option<Vec<Plan>>,
    pub forward_credentials: bool,
}

impl RouteEntry {
    pub fn allows(&self, plan: Plan) -> bool {
        self.plans
            .as_ref()
            .is_none_or(|plans| plans.contains(&plan))
    }

    fn matches(&self, path: &str) -> bool {
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRoute<'a> {
    pub entry: &'a RouteEntry,
    /// Request path with the route prefix removed; always starts with `/`.
    pub backend_path: String,
}

/// Static prefix table. Built once at startup and only read afterwards.
#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        let mut entries = routes
            .into_iter()
            .map(|r| RouteEntry {
                prefix: r.path_prefix,
                product: r.product,
                backend_url: r.backend_url,
                plans: r.plans,
                forward_credentials: r.forward_credentials,
            })
            .collect::<Vec<_>>();
        // Longest prefix first so the first match is the most specific one.
        entries.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { entries }
    }

    pub fn resolve(&self, path: &str) -> GatewayResult<ResolvedRoute<'_>> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.matches(path))
            .ok_or(GatewayError::RouteNotFound)?;

        let rest = &path[entry.prefix.len()..];
        let backend_path = if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        };

        Ok(ResolvedRoute {
            entry,
            backend_path,
        })
    }

    pub fn products_for(&self, plan: Plan) -> Vec<String> {
        let mut products = self
            .entries
            .iter()
            .filter(|entry| entry.allows(plan))
            .map(|entry| entry.product.clone())
            .collect::<Vec<_>>();
        products.sort();
        products.dedup();
        products
    }
}
