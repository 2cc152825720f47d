// vim: tw=80
//! Parity logging across crashes, faults, and full logs

use std::sync::Arc;

use pretty_assertions::assert_eq;

use eoraid_core::types::*;
use super::*;

/// A crash partway through reintegration leaves a log that can be replayed
/// again
#[test_log::test(tokio::test)]
async fn crash_during_reintegration() {
    let (mem, raid) = ArrayBuilder::new().parity_log(2).build().await;
    let config = raid.config().clone();
    let mut expected = Vec::new();
    for (i, lba) in [1, 7, 22, 23, 61].into_iter().enumerate() {
        let data = random(i as u64, 2 * 64);
        t!(write(&raid, lba, &data).await);
        expected.push((lba, data));
    }
    assert!(raid.parity_log().unwrap().stats(0).unwrap().dirty_sectors > 0);
    drop(raid);

    // Stripe 0's P is on unit 5
    mem.fail_write_at(5, 1);
    let r = VdevRaid::open(config.clone(), Arc::new(mem.clone())).await;
    assert_eq!(r.err(), Some(Error::Io(5)));

    let raid = t!(VdevRaid::open(config, Arc::new(mem.clone())).await);
    verify_all(&raid).await;
    for (lba, data) in expected.iter() {
        assert_eq!(&t!(read(&raid, *lba, data.len()).await), data);
    }
}

#[test_log::test(tokio::test)]
async fn corrupt_log() {
    let (mem, raid) = ArrayBuilder::new().parity_log(2).build().await;
    let config = raid.config().clone();
    drop(raid);
    // The log unit follows the data and redundancy units
    mem.poke(7, 0, b"garbage!");
    let e = VdevRaid::open(config, Arc::new(mem.clone())).await
        .err()
        .unwrap();
    assert_eq!(e, Error::ReplayInconsistency{region: 0, offset: 0});
    assert!(e.is_fatal());
}

/// Enough small writes to fill the on-disk log force a reintegration
#[test_log::test(tokio::test)]
async fn full_log() {
    let (_mem, raid) = ArrayBuilder::new().parity_log(2).build().await;
    let data = random(3, 40 * 64);
    for lba in 0..40u64 {
        let start = lba as usize * 64;
        t!(write(&raid, lba, &data[start..start + 64]).await);
    }
    let stats = raid.parity_log().unwrap().stats(0).unwrap();
    assert!(stats.reintegrations > 0);
    assert!(stats.log_bytes <= stats.log_capacity);
    assert_eq!(t!(read(&raid, 0, data.len()).await), data);
    verify_all(&raid).await;
}

/// While any unit is missing, redundancy is written in place
#[test_log::test(tokio::test)]
async fn degraded_writes_bypass_the_log() {
    let (mem, raid) = ArrayBuilder::new().parity_log(2).build().await;
    let plog = raid.parity_log().unwrap().clone();
    t!(write(&raid, 2, &random(4, 64)).await);
    let logged = plog.stats(0).unwrap().records_logged;
    assert!(logged > 0);

    mem.fail_unit(1);
    t!(raid.fault(1).await);
    let data = random(5, 3 * 64);
    t!(write(&raid, 5, &data).await);
    t!(write(&raid, 170, &data).await);
    assert_eq!(plog.stats(0).unwrap().records_logged, logged);
    assert!(!plog.is_logging(0));
    assert!(!plog.is_logging(1));

    mem.replace_unit(1);
    t!(raid.rebuild(1).await);
    assert!(plog.is_logging(0));
    verify_all(&raid).await;
    assert_eq!(t!(read(&raid, 170, data.len()).await), data);
}

/// A clean reopen replays the log and starts a new generation
#[test_log::test(tokio::test)]
async fn reopen() {
    let (mem, raid) = ArrayBuilder::new().parity_log(2).build().await;
    let config = raid.config().clone();
    let data = random(6, 90 * 64);
    t!(write(&raid, 100, &data).await);
    t!(raid.sync_all().await);
    drop(raid);

    let raid = t!(VdevRaid::open(config, Arc::new(mem.clone())).await);
    let plog = raid.parity_log().unwrap();
    for r in 0..plog.nregions() {
        let stats = plog.stats(r).unwrap();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.dirty_sectors, 0);
    }
    assert_eq!(t!(read(&raid, 100, data.len()).await), data);
    verify_all(&raid).await;
}
