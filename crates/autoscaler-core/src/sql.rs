//! SQL flavour detection for the databases the pipeline talks to.

/// SQL flavour of a database, picked from its connection URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// `None` when the scheme names no supported database.
    pub fn from_url(url: &str) -> Option<Self> {
        match url_scheme(url) {
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "mysql" | "mariadb" => Some(Dialect::MySql),
            "sqlite" => Some(Dialect::Sqlite),
            _ => None,
        }
    }

    /// Placeholder for the `n`th (1-based) bind parameter.
    pub fn param(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Comma-separated placeholders `1..=count`.
    pub fn params(self, count: usize) -> String {
        (1..=count)
            .map(|n| self.param(n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Everything before the first `:`.
pub fn url_scheme(url: &str) -> &str {
    url.split(':').next().unwrap_or_default()
}
