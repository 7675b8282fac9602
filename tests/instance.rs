use std::error::Error;

use kiln::{NativeOpsHolder, config::env};
use rayon::prelude::*;

fn skip_if_configured() -> bool {
    let configured = [env::NATIVE_OPS, env::INIT_NATIVE_OPS, env::CONF, env::NUM_THREADS]
        .into_iter()
        .any(|key| std::env::var_os(key).is_some());
    if configured {
        println!("backend environment is customized; skipping");
    }
    configured
}

#[test]
fn test_instance_is_shared() -> Result<(), Box<dyn Error>> {
    if skip_if_configured() {
        return Ok(());
    }

    let holders = (0..32)
        .into_par_iter()
        .map(|_| NativeOpsHolder::instance().map(|holder| holder as *const NativeOpsHolder as usize))
        .collect::<Result<Vec<_>, _>>()?;
    assert!(holders.windows(2).all(|pair| pair[0] == pair[1]));

    let holder = NativeOpsHolder::instance()?;
    let ops = holder.device_native_ops().expect("backend is set");
    assert_eq!(ops.name(), "cpu");
    assert!(ops.thread_count() >= 1);

    let sum = ops.run(|| (1..=100).sum::<u32>())?;
    assert_eq!(sum, 5050);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_instance_async() -> Result<(), Box<dyn Error>> {
    if skip_if_configured() {
        return Ok(());
    }

    let tasks = (0..8).map(|_| tokio::spawn(NativeOpsHolder::instance_async()));
    let holders = futures::future::join_all(tasks).await;
    let first = NativeOpsHolder::instance()?;
    for holder in holders {
        let holder = holder??;
        assert!(std::ptr::eq(holder, first));
    }
    Ok(())
}
