use robobridge_peer::{DEFAULT_WINDOW, MAX_WINDOW};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("robobridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let defaults = robobridge_peer::HandshakeConfig::default();
    println!("name: robobridge");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("ROBOBRIDGE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "protocol: {} {}",
        defaults.protocol_name, defaults.protocol_version
    );
    println!("window: default={DEFAULT_WINDOW} max={MAX_WINDOW}");
    println!("features: tls={}, cli=true", cfg!(feature = "tls"));

    Ok(SUCCESS)
}
