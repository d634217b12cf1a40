use anyhow::Error;
use serde_json::Value;

use proxmox_router::cli::{run_cli_command, CliCommand, CliEnvironment};
use proxmox_schema::api;

#[api(
    input: {
        properties: {
            "config-file": {
                type: String,
                description: "Path to the mirror configuration file.",
                optional: true,
            },
        },
    },
)]
/// Run one mirroring pass against the repositories named in the configuration file.
fn mirror(config_file: Option<String>, _param: Value) -> Result<Value, Error> {
    env_logger::init();

    let config_file = config_file.unwrap_or_else(|| "/etc/apt/mirror.list".to_string());
    let summary = apt_mirror_rs::run(std::path::Path::new(&config_file))?;
    println!("{summary}");

    Ok(Value::Null)
}

fn main() {
    let rpcenv = CliEnvironment::new();
    let cmd_def = CliCommand::new(&API_METHOD_MIRROR).arg_param(&["config-file"]);
    run_cli_command(cmd_def, rpcenv, None);
}
