// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_link::{
    buffer::{alloc_pool, Buffer, BufferId},
    bufque::BufQue,
    config::RuntimeConfig,
    link::LinkOutput,
    links::DupLink,
    Timeout,
};
use std::{error::Error, sync::Arc};

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for p in permutations(n - 1) {
        for pos in 0..=p.len() {
            let mut q = p.clone();
            q.insert(pos, n - 1);
            out.push(q);
        }
    }
    out
}

#[test]
fn test_release_in_any_order() -> Result<(), Box<dyn Error>> {
    let cfg = RuntimeConfig::default();
    for outputs in 1..=4 {
        for order in permutations(outputs) {
            let src = Arc::new(BufQue::new(1, 8, false, false, 8));
            src.put_full_list(alloc_pool(0, 0, 1, 0x1000, 64))
                .map_err(|r| r.status)?;
            let dup = DupLink::new("dup", src.clone(), 0, outputs, &cfg)?;
            dup.process_new_data();

            let mut held: Vec<Option<Buffer>> = (0..outputs)
                .map(|i| dup.get_full_buffers(i, 1).pop())
                .collect();
            for (n, &out) in order.iter().enumerate() {
                assert_eq!(src.empty_count(0), 0, "returned early, order {:?}", order);
                let b = held[out].take().expect("every output received a copy");
                dup.put_empty_buffers(out, vec![b])
                    .map_err(|r| r.status)?;
                if n + 1 < outputs {
                    assert_eq!(dup.tracked(), 1);
                }
            }
            assert_eq!(src.empty_count(0), 1, "order {:?}", order);
            assert_eq!(dup.tracked(), 0);
            let b = src.get_empty(0, Timeout::NoWait)?;
            assert_eq!(b.id(), BufferId(0));
            assert!(!b.is_dup());
        }
    }
    Ok(())
}

#[test]
fn test_three_outputs_partial_release() -> Result<(), Box<dyn Error>> {
    let src = Arc::new(BufQue::new(1, 4, false, false, 4));
    src.put_full(Buffer::new(BufferId(7), 0, 0x7000, 256))
        .map_err(|r| r.status)?;
    let dup = DupLink::new("dup", src.clone(), 0, 3, &RuntimeConfig::default())?;
    dup.process_new_data();

    let out0 = dup.get_full_buffers(0, 4);
    let out1 = dup.get_full_buffers(1, 4);
    let out2 = dup.get_full_buffers(2, 4);
    assert!(out0.iter().chain(&out1).chain(&out2).all(|b| b.id() == BufferId(7)));

    dup.put_empty_buffers(0, out0).map_err(|r| r.status)?;
    dup.put_empty_buffers(2, out2).map_err(|r| r.status)?;
    assert!(src.peek_empty(0, |b| b.id()).is_none());

    dup.put_empty_buffers(1, out1).map_err(|r| r.status)?;
    assert_eq!(src.empty_count(0), 1);
    assert_eq!(src.peek_empty(0, |b| b.id()), Some(BufferId(7)));

    let s = dup.stats().snapshot();
    assert_eq!((s.recv, s.forwarded, s.released, s.dropped), (1, 1, 1, 0));
    for i in 0..3 {
        let o = dup.output_stats(i).unwrap().snapshot();
        assert_eq!((o.forwarded, o.released), (1, 1));
    }
    Ok(())
}

#[test]
fn test_interleaved_buffers() -> Result<(), Box<dyn Error>> {
    let src = Arc::new(BufQue::new(1, 8, false, false, 8));
    src.put_full_list(alloc_pool(0, 0, 4, 0, 64))
        .map_err(|r| r.status)?;
    let dup = DupLink::new("dup", src.clone(), 0, 2, &RuntimeConfig::default())?;
    dup.process_new_data();
    assert_eq!(dup.tracked(), 4);

    // output 0 releases everything, output 1 releases in reverse
    dup.put_empty_buffers(0, dup.get_full_buffers(0, 8))
        .map_err(|r| r.status)?;
    let mut out1 = dup.get_full_buffers(1, 8);
    while let Some(b) = out1.pop() {
        dup.put_empty_buffers(1, vec![b]).map_err(|r| r.status)?;
        assert_eq!(src.peek_empty(0, |b| b.id()), Some(BufferId(3)));
    }
    assert_eq!(src.empty_count(0), 4);
    let ids: Vec<u32> = src
        .get_empty_list(0, 8, Timeout::NoWait)
        .iter()
        .map(|b| b.id().0)
        .collect();
    assert_eq!(ids, vec![3, 2, 1, 0]);
    Ok(())
}
