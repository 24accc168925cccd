//! Point-to-point transfers and the request ledger across a real world.

use rankcomm::{Error, LaunchConfig, Universe, ANY_SOURCE, ANY_TAG};

fn universe(ranks: usize) -> Universe {
    let _ = env_logger::builder().is_test(true).try_init();
    Universe::new(LaunchConfig::default().with_ranks(ranks)).unwrap()
}

#[test]
fn blocking_ring_exchange() {
    let results = universe(4)
        .run(|world| {
            let size = world.size();
            let next = (world.rank() + 1) % size;
            let prev = (world.rank() + size - 1) % size;
            world.send(&[world.rank() as i64 * 100], next, 3).unwrap();
            let mut got = [0i64; 1];
            let status = world.recv(&mut got, prev, 3).unwrap();
            assert_eq!(status.source, prev);
            assert_eq!(status.count::<i64>(), 1);
            got[0]
        })
        .unwrap();
    assert_eq!(results, vec![300, 0, 100, 200]);
}

#[test]
fn wildcard_receive_reports_sender() {
    let results = universe(3)
        .run(|world| {
            if world.rank() == 0 {
                let mut seen = Vec::new();
                for _ in 1..world.size() {
                    let mut buf = [0u8; 8];
                    let status = world.recv_bytes(&mut buf, ANY_SOURCE, ANY_TAG).unwrap();
                    assert_eq!(status.tag, status.source * 10);
                    assert_eq!(status.bytes, status.source as usize);
                    seen.push(status.source);
                }
                seen.sort_unstable();
                seen
            } else {
                let payload = vec![7u8; world.rank() as usize];
                world.send_bytes(&payload, 0, world.rank() * 10).unwrap();
                Vec::new()
            }
        })
        .unwrap();
    assert_eq!(results[0], vec![1, 2]);
}

#[test]
fn nonblocking_halo_exchange() {
    let results = universe(4)
        .run(|mut world| {
            let size = world.size();
            let left = (world.rank() + size - 1) % size;
            let right = (world.rank() + 1) % size;
            let from_left = world.arecv::<f64>(3, left, 0).unwrap();
            let from_right = world.arecv::<f64>(3, right, 1).unwrap();
            let mine = [world.rank() as f64; 3];
            world.asend(&mine, right, 0).unwrap();
            world.asend(&mine, left, 1).unwrap();
            assert_eq!(world.n_open_requests(), 4);

            let right_halo: Vec<f64> = world.wait_recv(from_right).unwrap().into_vec().unwrap();
            assert_eq!(world.n_open_requests(), 3);
            let rest = world.wait_all().unwrap();
            assert_eq!(world.n_open_requests(), 0);
            assert_eq!(rest.len(), 1);
            assert_eq!(rest[0].id, from_left);
            let left_halo: Vec<f64> = rest.into_iter().next().unwrap().into_vec().unwrap();
            (left_halo[0], right_halo[0])
        })
        .unwrap();
    assert_eq!(results, vec![(3.0, 1.0), (0.0, 2.0), (1.0, 3.0), (2.0, 0.0)]);
}

#[test]
fn persistent_requests_repeat_the_same_shape() {
    let results = universe(2)
        .run(|mut world| {
            let peer = 1 - world.rank();
            let send = world.set_send(&[0i32; 4], peer, 9).unwrap();
            let recv = world.set_recv::<i32>(4, peer, 9).unwrap();
            let mut total = 0;
            for step in 0..5 {
                world.update_send(send, &[step * (world.rank() + 1); 4]).unwrap();
                world.start_recv(recv).unwrap();
                world.start_send(send).unwrap();
                let halo: Vec<i32> = world.wait_recv(recv).unwrap().into_vec().unwrap();
                world.wait_send(send).unwrap();
                total += halo.iter().sum::<i32>();
            }
            assert_eq!(world.n_open_requests(), 2);
            assert_eq!(world.clear_requests(), 2);
            total
        })
        .unwrap();
    // Steps 0..5 sum to 10, four elements each.
    assert_eq!(results, vec![80, 40]);
}

#[test]
fn send_all_and_recv_all_start_every_registration() {
    let results = universe(3)
        .run(|mut world| {
            let me = world.rank();
            let peers: Vec<i32> = (0..world.size()).filter(|&p| p != me).collect();
            for &peer in &peers {
                world.set_send(&[me as u8], peer, 0).unwrap();
                world.set_recv::<u8>(1, peer, 0).unwrap();
            }
            assert_eq!(world.recv_all().unwrap(), 2);
            assert_eq!(world.send_all().unwrap(), 2);
            let mut got: Vec<u8> = world
                .wait_all()
                .unwrap()
                .into_iter()
                .flat_map(|r| r.into_bytes())
                .collect();
            got.sort_unstable();
            // Persistent registrations outlive wait_all.
            assert_eq!(world.n_open_requests(), 4);
            got
        })
        .unwrap();
    assert_eq!(results, vec![vec![1, 2], vec![0, 2], vec![0, 1]]);
}

#[test]
fn oversized_message_is_truncation() {
    let results = universe(2)
        .run(|mut world| {
            if world.rank() == 0 {
                world.send(&[1u32, 2, 3], 1, 0).unwrap();
                None
            } else {
                let id = world.arecv::<u32>(2, 0, 0).unwrap();
                Some(world.wait_recv(id))
            }
        })
        .unwrap();
    let err = results[1].as_ref().unwrap().as_ref().unwrap_err();
    assert!(matches!(
        err,
        Error::Truncated {
            capacity: 8,
            actual: 12
        }
    ));
}

#[test]
fn test_recv_polls_without_blocking() {
    let results = universe(2)
        .run(|mut world| {
            if world.rank() == 1 {
                let id = world.arecv::<u8>(1, 0, 0).unwrap();
                let early = world.test_recv(id).unwrap();
                world.barrier().unwrap();
                world.barrier().unwrap();
                let late = world.test_recv(id).unwrap();
                world.wait_recv(id).unwrap();
                (early, late)
            } else {
                world.barrier().unwrap();
                world.send(&[1u8], 1, 0).unwrap();
                world.barrier().unwrap();
                (false, false)
            }
        })
        .unwrap();
    assert_eq!(results[1], (false, true));
}
