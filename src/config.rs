use std::env;

/// M-Pesa Daraja credentials. Present only when all four values are set.
#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub passkey: String,
    pub shortcode: String,
    /// "sandbox" or "production"
    pub environment: String,
}

impl MpesaConfig {
    pub fn base_url(&self) -> &'static str {
        if self.environment == "production" {
            "https://api.safaricom.co.ke"
        } else {
            "https://sandbox.safaricom.co.ke"
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    /// Static bearer token for the admin endpoints. Admin routes reject
    /// everything when unset.
    pub admin_api_key: Option<String>,
    /// Force the non-durable in-memory store ("memory") instead of sqlite.
    pub memory_store: bool,
    /// Operator-notification webhook; log-only when unset.
    pub notify_webhook_url: Option<String>,
    pub mpesa: Option<MpesaConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let base_url =
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let memory_store = env::var("KEYDESK_STORE")
            .map(|v| v == "memory")
            .unwrap_or(false);

        let mpesa = match (
            env::var("MPESA_CONSUMER_KEY"),
            env::var("MPESA_CONSUMER_SECRET"),
            env::var("MPESA_PASSKEY"),
            env::var("MPESA_SHORTCODE"),
        ) {
            (Ok(consumer_key), Ok(consumer_secret), Ok(passkey), Ok(shortcode)) => {
                Some(MpesaConfig {
                    consumer_key,
                    consumer_secret,
                    passkey,
                    shortcode,
                    environment: env::var("MPESA_ENVIRONMENT")
                        .unwrap_or_else(|_| "sandbox".to_string()),
                })
            }
            _ => None,
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "keydesk.db".to_string()),
            base_url,
            admin_api_key: env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),
            memory_store,
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),
            mpesa,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
