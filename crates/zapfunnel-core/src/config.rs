use std::{collections::HashMap, env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{domain::InstanceName, errors::Error, Result};

/// Typed configuration for the funnel service.
///
/// Everything comes from environment variables (with `.env` support) so the
/// binary can run unchanged across deployments.
#[derive(Clone, Debug)]
pub struct Config {
    // Gateway
    pub gateway_base_url: String,
    pub gateway_api_key: String,
    pub instances: Vec<InstanceName>,
    pub send_timeout: Duration,

    // Funnel behavior
    pub pending_deadline: Duration,
    pub idempotency_ttl: Duration,
    pub default_product: String,
    pub product_map: HashMap<String, String>,

    // Persistence
    pub data_dir: PathBuf,
    pub snapshot_interval: Duration,

    // HTTP surface
    pub http_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let gateway_base_url =
            env_str("GATEWAY_BASE_URL").unwrap_or_else(|| "http://localhost:8080".to_string());
        let gateway_api_key = env_str("GATEWAY_API_KEY").unwrap_or_default();
        if gateway_api_key.trim().is_empty() {
            return Err(Error::Config(
                "GATEWAY_API_KEY environment variable is required".to_string(),
            ));
        }

        let instances = parse_csv(env_str("GATEWAY_INSTANCES"))
            .into_iter()
            .map(InstanceName)
            .collect::<Vec<_>>();
        if instances.is_empty() {
            return Err(Error::Config(
                "GATEWAY_INSTANCES environment variable is required (comma-separated pool)"
                    .to_string(),
            ));
        }

        let send_timeout = Duration::from_millis(env_u64("SEND_TIMEOUT_MS").unwrap_or(15_000));

        // Deadline for pending-payment funnels, from funnel start.
        let pending_deadline =
            Duration::from_secs(env_u64("PENDING_DEADLINE_SECS").unwrap_or(7 * 60));

        let idempotency_ttl =
            Duration::from_secs(env_u64("IDEMPOTENCY_TTL_SECS").unwrap_or(5 * 60));

        let default_product = env_str("DEFAULT_PRODUCT").unwrap_or_else(|| "CS".to_string());
        let product_map = parse_product_map(env_str("PRODUCT_MAP"));

        let data_dir = PathBuf::from(env_str("DATA_DIR").unwrap_or_else(|| "data".to_string()));
        let snapshot_interval =
            Duration::from_secs(env_u64("SNAPSHOT_INTERVAL_SECS").unwrap_or(30));

        let http_port = env_u64("PORT").unwrap_or(3000) as u16;

        Ok(Self {
            gateway_base_url,
            gateway_api_key,
            instances,
            send_timeout,
            pending_deadline,
            idempotency_ttl,
            default_product,
            product_map,
            data_dir,
            snapshot_interval,
            http_port,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `PRODUCT_MAP` maps payment-provider offer ids to product tags, e.g.
/// `uuid-1=CS,uuid-2=FAB`. Unknown offer ids fall back to `UNKNOWN` at the
/// event boundary.
fn parse_product_map(v: Option<String>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for entry in parse_csv(v) {
        let Some((offer, product)) = entry.split_once('=') else {
            continue;
        };
        let offer = offer.trim();
        let product = product.trim();
        if offer.is_empty() || product.is_empty() {
            continue;
        }
        out.insert(offer.to_string(), product.to_uppercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_map_parses_pairs_and_skips_garbage() {
        let map = parse_product_map(Some(
            "abc=cs, def=FAB, broken, =x, trailing= ".to_string(),
        ));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("abc").map(String::as_str), Some("CS"));
        assert_eq!(map.get("def").map(String::as_str), Some("FAB"));
    }

    #[test]
    fn csv_trims_and_drops_empties() {
        let v = parse_csv(Some(" A01 ,, B02 ,".to_string()));
        assert_eq!(v, vec!["A01".to_string(), "B02".to_string()]);
    }
}
