use microbus_session::{BusClientConfig, ChannelConfig, InitPollingConfig};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("microbus {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let init = InitPollingConfig::default();
    let channel = ChannelConfig::default();
    let client = BusClientConfig::default();

    println!("name: microbus");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("init_interval_ms: {}", init.interval.as_millis());
    println!("init_timeout_ms: {}", init.timeout.as_millis());
    println!(
        "request_timeout_ms: {}",
        channel.request_timeout.as_millis()
    );
    println!("max_pending_requests: {}", client.max_pending);

    Ok(SUCCESS)
}
