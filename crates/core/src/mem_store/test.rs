use super::*;

const HOUR_USEC: i64 = 3_600_000_000;

fn now() -> Timestamp {
    Timestamp::now()
}

fn key(guid: u64, time_usec: i64, ttl_sec: i32, is_put: bool) -> Key {
    Key {
        time_usec,
        ttl_sec,
        guid: Guid::from_high_u64(guid),
        secret_hash: [7; HASH_LEN],
        data_hash: [9; HASH_LEN],
        is_put,
        client_id: [127, 0, 0, 1].into(),
    }
}

fn recent() -> i64 {
    now().as_micros() - HOUR_USEC
}

#[tokio::test]
async fn same_key_is_a_no_op() {
    let s = MemStore::new();
    let k = key(1, recent(), 7200, true);
    assert!(s.put(k, Bytes::from_static(b"a")).await.unwrap().stored);
    let out = s.put(k, Bytes::from_static(b"a")).await.unwrap();
    assert_eq!(None, out.invalidated);
    assert_eq!(1, s.len().await);
}

#[tokio::test]
async fn later_expiring_put_wins() {
    let s = MemStore::new();
    let t = recent();
    let short = key(1, t, 7200, true);
    let long = key(1, t + 1, 7200, true);

    s.put(short, Bytes::from_static(b"a")).await.unwrap();
    let out = s.put(long, Bytes::from_static(b"a")).await.unwrap();
    assert!(out.stored);
    assert_eq!(Some(short), out.invalidated);
    assert_eq!(vec![long], s.keys().await);

    // the shorter one now loses
    let out = s.put(short, Bytes::from_static(b"a")).await.unwrap();
    assert!(!out.stored);
    assert_eq!(Some(short), out.invalidated);
    assert_eq!(vec![long], s.keys().await);
}

#[tokio::test]
async fn remove_beats_put_in_either_order() {
    let t = recent();
    let put = key(1, t, 7200, true);
    let rm = key(1, t + 10, 7200, false);

    let s = MemStore::new();
    s.put(put, Bytes::from_static(b"v")).await.unwrap();
    let out = s.put(rm, Bytes::from_static(b"secret")).await.unwrap();
    assert!(out.stored);
    assert_eq!(Some(put), out.invalidated);
    assert_eq!(vec![rm], s.keys().await);

    let s = MemStore::new();
    s.put(rm, Bytes::from_static(b"secret")).await.unwrap();
    let out = s.put(put, Bytes::from_static(b"v")).await.unwrap();
    assert!(!out.stored);
    assert_eq!(Some(put), out.invalidated);
    assert_eq!(vec![rm], s.keys().await);
}

#[tokio::test]
async fn later_expiring_remove_wins() {
    let t = recent();
    let a = key(1, t, 7200, false);
    let b = key(1, t, 9000, false);

    let s = MemStore::new();
    s.put(b, Bytes::new()).await.unwrap();
    let out = s.put(a, Bytes::new()).await.unwrap();
    assert!(!out.stored);
    assert_eq!(Some(a), out.invalidated);
    assert_eq!(vec![b], s.keys().await);
}

#[tokio::test]
async fn different_data_hash_does_not_conflict() {
    let s = MemStore::new();
    let a = key(1, recent(), 7200, true);
    let mut b = a;
    b.data_hash = [1; HASH_LEN];
    s.put(a, Bytes::new()).await.unwrap();
    let out = s.put(b, Bytes::new()).await.unwrap();
    assert!(out.stored);
    assert_eq!(None, out.invalidated);
    assert_eq!(2, s.len().await);
}

#[tokio::test]
async fn expired_tuples_are_invisible() {
    let s = MemStore::new();
    let gone = key(1, recent() - 10 * HOUR_USEC, 60, true);
    s.put(gone, Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(None, s.get(gone, now()).await.unwrap());
    let keys = s
        .scan_by_time(0, i64::MAX, GuidRange::FULL, 100, now())
        .await
        .unwrap();
    assert!(keys.is_empty());
}

#[tokio::test]
async fn scan_is_half_open_filtered_and_limited() {
    let s = MemStore::new();
    let t = recent();
    for i in 0..10u64 {
        s.put(key(i, t + i as i64, 7200, true), Bytes::new())
            .await
            .unwrap();
    }

    let keys = s
        .scan_by_time(t + 2, t + 5, GuidRange::FULL, 100, now())
        .await
        .unwrap();
    assert_eq!(
        vec![t + 2, t + 3, t + 4],
        keys.iter().map(|k| k.time_usec).collect::<Vec<_>>()
    );

    let range = GuidRange::new(Guid::from_high_u64(4), Guid::from_high_u64(7));
    let keys = s
        .scan_by_time(0, i64::MAX, range, 100, now())
        .await
        .unwrap();
    assert_eq!(4, keys.len());

    let keys = s
        .scan_by_time(0, i64::MAX, GuidRange::FULL, 3, now())
        .await
        .unwrap();
    assert_eq!(
        vec![t, t + 1, t + 2],
        keys.iter().map(|k| k.time_usec).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn recycle_index_follows_responsibility() {
    let s = MemStore::new();
    let t = recent();
    let inside = key(5, t, 7200, true);
    let outside = key(50, t, 7200, true);
    s.put(inside, Bytes::from_static(b"in")).await.unwrap();
    s.put(outside, Bytes::from_static(b"out")).await.unwrap();
    assert_eq!(0, s.recycled_len().await);
    assert_eq!(None, s.first_recycled(Guid::MIN).await.unwrap());

    s.set_responsible_range(GuidRange::new(
        Guid::from_high_u64(1),
        Guid::from_high_u64(10),
    ))
    .await
    .unwrap();
    assert_eq!(1, s.recycled_len().await);

    let (k, v) = s.first_recycled(Guid::MIN).await.unwrap().unwrap();
    assert_eq!(outside, k);
    assert_eq!(&b"out"[..], &v[..]);

    // does not wrap
    assert_eq!(
        None,
        s.first_recycled(Guid::from_high_u64(51)).await.unwrap()
    );

    // new puts outside the range land in the index too
    let later = key(60, t, 7200, true);
    s.put(later, Bytes::new()).await.unwrap();
    assert_eq!(2, s.recycled_len().await);

    s.delete(outside).await.unwrap();
    s.delete(later).await.unwrap();
    assert_eq!(0, s.recycled_len().await);
    assert_eq!(vec![inside], s.keys().await);
}
