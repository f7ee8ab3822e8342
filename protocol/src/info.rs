use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one published or viewed stream. `key` and `id` are both
/// set to the uid minted at authentication time; `url` is `tcUrl + "/" + name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Info {
    pub id: String,
    pub key: String,
    pub publisher: bool,
    pub name: String,
    pub app: String,
    pub url: String,
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<id: {}, key: {}, name: {}, app: {}, url: {}, publisher: {}>",
            self.id, self.key, self.name, self.app, self.url, self.publisher
        )
    }
}
