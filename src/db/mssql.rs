//! SQL Server connections over TDS, backed by `tiberius`.

use crate::config::PoolConfig;
use crate::db::connector::{Connection, Connector};
use crate::db::types::RowShaping;
use crate::error::{DriverError, codes};
use crate::models::{RawResult, Recordset};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, QueryItem, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

/// Server error numbers reported for rejected logins.
const LOGIN_ERROR_NUMBERS: &[u32] = &[18452, 18456, 18486, 18487, 18488, 4060];

/// Opens TDS connections for a pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct TiberiusConnector;

impl TiberiusConnector {
    pub fn new() -> Self {
        Self
    }

    /// Driver configuration for a pool.
    pub fn driver_config(config: &PoolConfig) -> Config {
        let mut tds = Config::new();

        tds.host(&config.server);
        // Left unset, the driver picks 1433, or the SQL Browser port for a named instance.
        if let Some(port) = config.port {
            tds.port(port);
        }
        tds.database(&config.database);
        tds.application_name(&config.application_name);

        if let Some(instance) = &config.instance_name {
            tds.instance_name(instance);
        }

        tds.authentication(auth_method(config));

        tds.encryption(if config.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::Off
        });
        if config.trust_server_certificate {
            tds.trust_cert();
        }

        if let Some(version) = &config.tds_version {
            debug!(tds_version = %version, "Protocol version is negotiated by the driver");
        }

        tds
    }

    async fn open(tds: Config, named: bool) -> Result<Client<Compat<TcpStream>>, tiberius::error::Error> {
        let tcp = if named {
            TcpStream::connect_named(&tds).await?
        } else {
            TcpStream::connect(tds.get_addr()).await?
        };
        tcp.set_nodelay(true).ok();
        Client::connect(tds, tcp.compat_write()).await
    }
}

#[cfg(all(windows, feature = "winauth"))]
fn auth_method(config: &PoolConfig) -> AuthMethod {
    let password = config.password.as_deref().unwrap_or("");
    match &config.domain {
        Some(domain) => AuthMethod::windows(format!("{}\\{}", domain, config.username), password),
        None => AuthMethod::sql_server(&config.username, password),
    }
}

#[cfg(not(all(windows, feature = "winauth")))]
fn auth_method(config: &PoolConfig) -> AuthMethod {
    if config.domain.is_some() {
        warn!(
            user = %config.username,
            "Domain authentication is not available in this build, using SQL Server authentication"
        );
    }
    AuthMethod::sql_server(&config.username, config.password.as_deref().unwrap_or(""))
}

#[async_trait]
impl Connector for TiberiusConnector {
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn Connection>, DriverError> {
        let tds = Self::driver_config(config);
        let named = config.instance_name.is_some();

        let client = match Self::open(tds.clone(), named).await {
            Ok(client) => client,
            // Azure SQL gateways redirect the login to another node.
            Err(tiberius::error::Error::Routing { host, port }) => {
                debug!(host = %host, port = port, "Following server redirect");
                let mut routed = tds;
                routed.host(&host);
                routed.port(port);
                Self::open(routed, false).await.map_err(connect_error)?
            }
            Err(e) => return Err(connect_error(e)),
        };

        Ok(Box::new(TiberiusConnection {
            client,
            shaping: RowShaping::from(config),
        }))
    }
}

/// Classify a failure raised while opening a connection.
fn connect_error(err: tiberius::error::Error) -> DriverError {
    let mut error = DriverError::from(err);
    error.name = "ConnectionError".to_string();
    if error.number.is_some_and(|n| LOGIN_ERROR_NUMBERS.contains(&n)) {
        error.code = codes::ELOGIN.to_string();
    } else if error.code == codes::EREQUEST {
        error.code = codes::ESOCKET.to_string();
    }
    error
}

/// One open TDS session.
pub struct TiberiusConnection {
    client: Client<Compat<TcpStream>>,
    shaping: RowShaping,
}

#[async_trait]
impl Connection for TiberiusConnection {
    async fn query(&mut self, sql: &str) -> Result<RawResult, DriverError> {
        let shaping = self.shaping;
        let mut stream = self.client.simple_query(sql).await?;

        let mut recordsets: Vec<Recordset> = Vec::new();
        let mut current: Option<(Vec<String>, Recordset)> = None;

        while let Some(item) = stream.try_next().await? {
            match item {
                QueryItem::Metadata(meta) => {
                    if let Some((columns, rows)) = current.take() {
                        recordsets.push(shaping.finish_recordset(&columns, rows)?);
                    }
                    let columns = meta.columns().iter().map(|c| c.name().to_string()).collect();
                    current = Some((columns, Vec::new()));
                }
                QueryItem::Row(row) => {
                    let names: Vec<String> =
                        row.columns().iter().map(|c| c.name().to_string()).collect();
                    let values = row.into_iter().map(|data| shaping.column_value(data));
                    let shaped = shaping.build_row(names.into_iter().zip(values));
                    match current.as_mut() {
                        Some((_, rows)) => rows.push(shaped),
                        None => current = Some((Vec::new(), vec![shaped])),
                    }
                }
            }
        }

        if let Some((columns, rows)) = current.take() {
            recordsets.push(shaping.finish_recordset(&columns, rows)?);
        }

        Ok(RawResult::new(recordsets))
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.client.close().await.map_err(DriverError::from)
    }
}
