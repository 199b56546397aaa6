//! Product catalog (`catalog.json`): plans, prices, features and add-ons.

use serde::{Deserialize, Serialize};

use super::{Collection, Passage};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub addons: Vec<Addon>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Other names customers use for the product (matched case-insensitively).
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub price: Price,
    /// None means unlimited users.
    #[serde(default)]
    pub user_limit: Option<u32>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub limitations: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Price {
    pub monthly: f64,
    pub annual: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Addon {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub price: f64,
}

impl Catalog {
    pub fn product(&self, id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.id.eq_ignore_ascii_case(id))
    }

    pub fn addon(&self, id: &str) -> Option<&Addon> {
        self.addons.iter().find(|a| a.id.eq_ignore_ascii_case(id))
    }

    /// (lower-case name or alias, id) for every product and add-on, longest names first so
    /// "cloudmanager pro" is tried before "pro plan".
    pub fn names(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for p in &self.products {
            out.push((p.name.to_lowercase(), p.id.clone()));
            out.push((p.id.to_lowercase(), p.id.clone()));
            out.extend(p.aliases.iter().map(|a| (a.to_lowercase(), p.id.clone())));
        }
        for a in &self.addons {
            out.push((a.name.to_lowercase(), a.id.clone()));
            out.push((a.id.to_lowercase(), a.id.clone()));
            out.extend(a.aliases.iter().map(|al| (al.to_lowercase(), a.id.clone())));
        }
        out.sort_by(|x, y| y.0.len().cmp(&x.0.len()).then_with(|| x.0.cmp(&y.0)));
        out.dedup_by(|x, y| x.0 == y.0);
        out
    }

    /// Display name for a product or add-on id.
    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.product(id)
            .map(|p| p.name.as_str())
            .or_else(|| self.addon(id).map(|a| a.name.as_str()))
    }

    pub(super) fn passages(&self) -> Vec<Passage> {
        let mut out = Vec::new();
        for p in &self.products {
            let mut text = format!(
                "{} ({}): {}\nPrice: ${:.2} per month or ${:.2} per year.",
                p.name, p.id, p.description, p.price.monthly, p.price.annual
            );
            match p.user_limit {
                Some(n) => text.push_str(&format!("\nUsers: up to {}.", n)),
                None => text.push_str("\nUsers: unlimited."),
            }
            for f in &p.features {
                text.push_str(&format!("\nFeature: {} - {}", f.name, f.description));
            }
            for l in &p.limitations {
                text.push_str(&format!("\nLimitation: {}", l));
            }
            let mut tags = vec![p.id.clone(), "plan".to_string(), "pricing".to_string()];
            tags.extend(p.aliases.iter().cloned());
            out.push(Passage {
                id: format!("product-{}", p.id),
                collection: Collection::Products,
                title: p.name.clone(),
                text,
                tags,
            });
        }
        for a in &self.addons {
            let mut tags = vec![a.id.clone(), "addon".to_string(), "pricing".to_string()];
            tags.extend(a.aliases.iter().cloned());
            out.push(Passage {
                id: format!("addon-{}", a.id),
                collection: Collection::Products,
                title: a.name.clone(),
                text: format!(
                    "{} add-on ({}): {}\nPrice: ${:.2} per month.",
                    a.name, a.id, a.description, a.price
                ),
                tags,
            });
        }
        out
    }
}
