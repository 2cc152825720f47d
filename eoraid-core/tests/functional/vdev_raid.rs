// vim: tw=80
//! Reads and writes through every fault pattern the code tolerates

use futures::{TryStreamExt, stream::FuturesUnordered};
use itertools::Itertools;
use pretty_assertions::assert_eq;
use rstest::rstest;

use eoraid_core::{types::*, vdev::Health};
use super::*;

#[rstest]
#[case::smallest(3, 3)]
#[case::short(3, 5)]
#[case::full(5, 5)]
#[case::wide(7, 17)]
#[tokio::test]
async fn fault_free(#[case] ndata: usize, #[case] prime: usize) {
    let (_mem, raid) = ArrayBuilder::new().geometry(ndata, prime).build().await;
    let data = random(ndata as u64, raid.size() as usize * 64);
    t!(write(&raid, 0, &data).await);
    assert_eq!(t!(read(&raid, 0, data.len()).await), data);
    verify_all(&raid).await;
}

/// Lose every possible pair of units, then read everything back
#[rstest]
#[case(3, 3)]
#[case(4, 5)]
#[case(5, 5)]
#[tokio::test]
async fn any_two_failures(#[case] ndata: usize, #[case] prime: usize) {
    let nunits = ndata + 2;
    for (a, b) in (0..nunits as UnitT).tuple_combinations() {
        let (mem, raid) = ArrayBuilder::new()
            .geometry(ndata, prime)
            .build().await;
        let data = random(u64::from(a * 16 + b), raid.size() as usize * 64);
        t!(write(&raid, 0, &data).await);
        for u in [a, b] {
            mem.fail_unit(u);
            t!(raid.fault(u).await);
        }
        assert_eq!(raid.health().as_degraded().map(|d| d.get()), Some(2));
        assert_eq!(t!(read(&raid, 0, data.len()).await), data,
            "units {a} and {b} failed");
    }
}

/// Small reads that straddle stripe unit and stripe boundaries, with one unit
/// lost
#[tokio::test]
async fn degraded_unaligned_reads() {
    let (mem, raid) = ArrayBuilder::new().build().await;
    let data = random(1, raid.size() as usize * 64);
    t!(write(&raid, 0, &data).await);
    mem.fail_unit(4);
    t!(raid.fault(4).await);
    for (lba, n) in [(0, 1), (3, 2), (7, 9), (18, 5), (39, 23), (100, 60)] {
        let start = lba as usize * 64;
        let end = start + n * 64;
        assert_eq!(t!(read(&raid, lba, n * 64).await), &data[start..end],
            "lba {lba} len {n}");
    }
}

/// Writes while degraded keep the lost units reconstructable, and a rebuild
/// restores full redundancy
#[rstest]
#[case::one(&[2])]
#[case::two_data(&[0, 3])]
#[case::data_and_redundancy(&[1, 6])]
#[case::both_redundancy_of_stripe_0(&[5, 6])]
#[tokio::test]
async fn degraded_writes_then_rebuild(#[case] lost: &[UnitT]) {
    let (mem, raid) = ArrayBuilder::new().build().await;
    let mut data = random(2, raid.size() as usize * 64);
    t!(write(&raid, 0, &data).await);
    for &u in lost {
        mem.fail_unit(u);
        t!(raid.fault(u).await);
    }
    for (i, (lba, n)) in [(1, 2), (6, 4), (20, 20), (45, 30), (150, 3)]
        .into_iter()
        .enumerate()
    {
        let patch = random(100 + i as u64, n * 64);
        t!(write(&raid, lba, &patch).await);
        let start = lba as usize * 64;
        data[start..start + patch.len()].copy_from_slice(&patch);
    }
    assert_eq!(t!(read(&raid, 0, data.len()).await), data);

    for &u in lost {
        mem.replace_unit(u);
        t!(raid.rebuild(u).await);
    }
    assert_eq!(raid.health(), Health::Online);
    assert_eq!(raid.needs_rebuild(), 0);
    verify_all(&raid).await;
    assert_eq!(t!(read(&raid, 0, data.len()).await), data);
}

/// Requests are split at stripe boundaries and the stripes run concurrently
#[tokio::test]
async fn concurrent_requests() {
    let (_mem, raid) = ArrayBuilder::new().parity_log(4).build().await;
    let chunks = (0..8u64)
        .map(|i| (i * 40 + 3, random(i, 17 * 64)))
        .collect::<Vec<_>>();
    chunks.iter()
        .map(|(lba, data)| write(&raid, *lba, data))
        .collect::<FuturesUnordered<_>>()
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    for (lba, data) in chunks.iter() {
        assert_eq!(&t!(read(&raid, *lba, data.len()).await), data);
    }
    verify_all(&raid).await;
}

#[tokio::test]
async fn too_many_failures() {
    let (mem, raid) = ArrayBuilder::new().build().await;
    for u in [0, 2, 5] {
        mem.fail_unit(u);
        t!(raid.fault(u).await);
    }
    assert_eq!(raid.health(), Health::Faulted);
    let e = read(&raid, 0, 64).await.unwrap_err();
    assert_eq!(e, Error::Config(FaultPattern::new(2, true, false)));
    assert!(e.is_fatal());
}

#[tokio::test]
async fn out_of_range() {
    let (_mem, raid) = ArrayBuilder::new().build().await;
    let size = raid.size();
    assert_eq!(read(&raid, size - 1, 128).await,
        Err(Error::InvalidRequest("request past end of array")));
    assert_eq!(write(&raid, 0, &[]).await,
        Err(Error::InvalidRequest("empty request")));
}
