mod common;

use std::sync::Arc;

use common::square;
use pcg_search::graph::OperatorRegistry;
use pcg_search::machine::MachineResource;
use pcg_search::ops::{DataType, OpParams, OperatorKind, ParallelTensorShape, UnaryOp};
use pcg_search::Infeasible;

#[test]
fn test_equal_signatures_share_one_operator() {
    let reg = OperatorRegistry::new(&MachineResource::new(1, 4, 0));
    let s = square(32);
    let a = reg.linear(&s, 64, true, Some(UnaryOp::Relu)).unwrap();
    let b = reg.linear(&s, 64, true, Some(UnaryOp::Relu)).unwrap();
    assert!(Arc::ptr_eq(&a.op, &b.op));
    assert_ne!(a, b);
    assert!(b.guid > a.guid);

    let stats = reg.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_any_differing_field_creates_a_new_operator() {
    let reg = OperatorRegistry::new(&MachineResource::new(1, 4, 0));
    let s = square(32);
    let base = reg.linear(&s, 64, true, None).unwrap();
    let variants = [
        reg.linear(&s, 32, true, None).unwrap(),
        reg.linear(&s, 64, false, None).unwrap(),
        reg.linear(&s, 64, true, Some(UnaryOp::Gelu)).unwrap(),
        reg.linear(&ParallelTensorShape::new(&[16, 32], DataType::F32), 64, true, None).unwrap(),
        reg.linear(&ParallelTensorShape::new(&[32, 32], DataType::F16), 64, true, None).unwrap(),
    ];
    for v in &variants {
        assert!(!Arc::ptr_eq(&base.op, &v.op), "{} shares {}", v, base);
    }
    assert_eq!(reg.num_operators(), 1 + variants.len());
}

#[test]
fn test_invalid_params_are_rejected() {
    let reg = OperatorRegistry::new(&MachineResource::new(1, 4, 0));
    let lhs = square(8);
    let rhs = square(16);
    assert_eq!(
        reg.batch_matmul(&lhs, &rhs).unwrap_err(),
        Infeasible::InvalidParams {
            kind: OperatorKind::BatchMatmul
        }
    );
    assert_eq!(
        reg.get_or_create_node(OpParams::Noop, &[]).unwrap_err(),
        Infeasible::InvalidParams {
            kind: OperatorKind::Noop
        }
    );
    // failed requests leave no operator behind
    assert_eq!(reg.num_operators(), 0);
}

#[test]
fn test_replicate_beyond_workers_per_node_is_infeasible() {
    let reg = OperatorRegistry::new(&MachineResource::new(2, 2, 0));
    let s = square(8);
    let replica = s.replica_dim();
    let once = reg.replicate(&s, replica, 2).unwrap();
    let replicated = once.op.output_shapes()[0].clone();
    assert_eq!(replicated.dims()[replica].degree, 2);

    let err = reg.replicate(&replicated, replica, 2).unwrap_err();
    assert_eq!(err, Infeasible::ExceedsWorkersPerNode { degree: 4, limit: 2 });
}

#[test]
fn test_partition_beyond_cluster_is_infeasible() {
    let reg = OperatorRegistry::new(&MachineResource::new(1, 4, 0));
    let s = square(64);
    assert!(reg.repartition(&s, 0, 4).is_ok());
    assert_eq!(
        reg.repartition(&s, 0, 8).unwrap_err(),
        Infeasible::ExceedsCluster { parts: 8, limit: 4 }
    );
}
