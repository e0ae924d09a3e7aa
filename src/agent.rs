use std::time::Instant;

use config::AgentConfig;
use error::Result;
use interrupt;
use socket::SocketFabric;
use threads::Reconciler;

/// Run the agent to completion: build the socket fabric and shake hands with
/// the collector, block the overflow signal, then alternate between draining
/// pending overflows and reconciling the target's thread set until the
/// target is gone.
///
/// Counters are opened and armed by the first reconciler cycle, strictly
/// after every collector connection is up and the signal is routed.
pub fn run(config: AgentConfig) -> Result<()> {
    info!(
        "sampling threads of {:?} every {} events on {} cpus as {:?}",
        config.command, config.threshold, config.cores, config.label
    );

    let mut fabric = SocketFabric::connect(config.cores, &config.label, &config.command)?;
    let signals = interrupt::install()?;
    let mut reconciler = Reconciler::new(&config);

    let mut live = reconciler.cycle(&mut fabric)?;

    while live {
        let deadline = Instant::now() + config.interval();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            match interrupt::wait(&signals, deadline - now) {
                Some(overflow) => {
                    interrupt::handle(overflow, reconciler.table_mut(), &mut fabric)?
                }
                None => break,
            }
        }

        live = reconciler.cycle(&mut fabric)?;
    }

    info!("target is gone, shutting down");
    fabric.shutdown();

    // dropping the reconciler unmaps and closes every group and unwind
    // context; dropping the fabric unlinks the per-cpu socket files
    Ok(())
}
