use anyhow::{bail, Result};
use indexmap::IndexMap;
use std::io::Write;

use sermatec_bridge::prelude::*;
use sermatec_bridge::sermatec::{frame, parameter};
use sermatec_bridge::CARGO_PKG_VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    let mut config = match (&options.config_file, &options.host) {
        (Some(file), _) => Config::new(file.clone())?,
        (None, Some(host)) => Config::for_host(host),
        (None, None) => bail!("either a config file or an inverter host is required"),
    };
    if let Some(host) = &options.host {
        config.inverter.host = host.clone();
    }
    if let Some(port) = options.port {
        config.inverter.port = port;
    }
    if let Some(protocol_file) = &options.protocol_file {
        config.protocol_file = protocol_file.clone();
    }
    config.validate()?;

    let loglevel = if options.verbose { "debug" } else { config.loglevel() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(loglevel))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .target(env_logger::Target::Stderr)
        .init();

    info!("sermatec-bridge {} starting", CARGO_PKG_VERSION);
    config.log_summary();

    let mut inverter = Inverter::from_config(&config)?;
    inverter.connect().await?;

    let result = run(&mut inverter, &options).await;
    inverter.disconnect().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

async fn run(inverter: &mut Inverter, options: &Options) -> Result<IndexMap<String, serde_json::Value>> {
    let mut r = IndexMap::new();

    for (name, value) in &options.set {
        let friendly = parameter::parameter_info(name)?.friendly_type.parse(value)?;
        inverter.set_parameter(name, &friendly).await?;
        r.insert(format!("set:{}", name), serde_json::to_value(&friendly)?);
    }

    if options.list {
        let version = inverter.version();
        for code in inverter.registry().query_commands(version) {
            match inverter.list_fields(code) {
                Ok(fields) => {
                    r.insert(format!("0x{:02x}", code), serde_json::to_value(&fields)?);
                }
                Err(e) => warn!("0x{:02x}: {}", code, e),
            }
        }
    }

    if let Some(code) = options.raw {
        let frames: Vec<String> = inverter
            .query_raw(code)
            .await?
            .iter()
            .map(|f| frame::hex(f))
            .collect();
        r.insert(format!("raw:0x{:02x}", code), serde_json::to_value(frames)?);
    }

    if let Some(code) = options.custom {
        let fields = inverter.query_custom(code).await?;
        r.insert(format!("0x{:02x}", code), serde_json::to_value(&fields)?);
    }

    let names: Vec<String> = match (&options.get[..], r.is_empty()) {
        // nothing else asked for: read every dataset once
        ([], true) => {
            let mut seen = Vec::new();
            inverter
                .registry()
                .short_names()
                .filter(|(_, code)| {
                    let first = !seen.contains(code);
                    seen.push(*code);
                    first
                })
                .map(|(name, _)| name.to_string())
                .collect()
        }
        (names, _) => names.to_vec(),
    };

    for name in names {
        match inverter.query(&name).await {
            Ok(fields) => {
                r.insert(name, serde_json::to_value(&fields)?);
            }
            // one firmware may lack a dataset another has
            Err(e @ Error::CommandNotFound(_)) => warn!("{}: {}", name, e),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(r)
}
