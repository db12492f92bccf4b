use crate::assert_err;
use crate::nn::{FunctionId, Graph, GraphError};
use crate::tensor::NdArray;

#[test]
fn test_create_and_get() {
    let mut graph = Graph::new();
    let id = graph.create(&[2, 3], 2);
    let array = graph.get(id).unwrap();
    assert_eq!(array.full_shape(), vec![2, 2, 3]);
    assert!(array.is_leaf());
    assert_eq!(graph.live_count(), 1);
    assert!(graph.contains(id));
}

#[test]
fn test_wrap_records_producer() {
    let mut graph = Graph::new();
    let producer = FunctionId::next();
    let id = graph.wrap(vec![1.0, 2.0], &[2], 1, producer).unwrap();
    assert_eq!(graph.get(id).unwrap().parent(), Some(producer));

    assert_err!(
        graph.wrap(vec![1.0], &[2], 1, producer),
        GraphError::ShapeMismatch { .. }
    );
}

#[test]
fn test_release_reclaims_slot_and_invalidates_handle() {
    let mut graph = Graph::new();
    let id = graph.wrap(vec![1.0], &[1], 1, FunctionId::next()).unwrap();
    assert_eq!(graph.release(id), Ok(true));
    assert_eq!(graph.live_count(), 0);
    assert_err!(graph.get(id), GraphError::TensorNotFound(id));

    // 槽位被复用，但旧句柄仍然失效
    let reused = graph.create(&[1], 1);
    assert_eq!(reused.index(), id.index());
    assert_ne!(reused.generation(), id.generation());
    assert_err!(graph.get(id), GraphError::TensorNotFound(id));
    assert!(graph.get(reused).is_ok());
}

#[test]
fn test_release_leaf_is_noop() {
    let mut graph = Graph::new();
    let leaf = graph.insert(NdArray::from_batch(&[3.0, 4.0], &[1], 2).unwrap());
    assert_eq!(graph.release(leaf), Ok(false));
    // 仍有消费者时同样是空操作，不报错
    graph.add_consumer(leaf).unwrap();
    assert_eq!(graph.release(leaf), Ok(false));

    let array = graph.get(leaf).unwrap();
    assert_eq!(array.data(), &[3.0, 4.0]);
    assert_eq!(array.sample(1), &[4.0]);
    assert_eq!(array.use_count(), 1);
    assert_eq!(graph.live_count(), 1);
}

#[test]
fn test_release_with_pending_consumers() {
    let mut graph = Graph::new();
    let id = graph.wrap(vec![1.0], &[1], 1, FunctionId::next()).unwrap();
    graph.add_consumer(id).unwrap();
    graph.add_consumer(id).unwrap();
    assert_eq!(
        graph.release(id),
        Err(GraphError::PendingConsumers { id, remaining: 2 })
    );

    assert_eq!(graph.visit(id), Ok(1));
    assert_eq!(graph.visit(id), Ok(0));
    assert_eq!(graph.release(id), Ok(true));
}

#[test]
fn test_visit_more_than_consumers() {
    let mut graph = Graph::new();
    let id = graph.create(&[1], 1);
    assert_err!(graph.visit(id), GraphError::InvalidOperation(_));
}

#[test]
fn test_take_leaf() {
    let mut graph = Graph::new();
    let id = graph.insert(NdArray::from_data(&[1.0, 2.0], &[2]).unwrap());
    graph.add_consumer(id).unwrap();
    assert_err!(graph.take(id), GraphError::PendingConsumers { remaining: 1, .. });

    graph.visit(id).unwrap();
    let array = graph.take(id).unwrap();
    assert_eq!(array.data(), &[1.0, 2.0]);
    assert_eq!(graph.live_count(), 0);
}

#[test]
fn test_gradient_helpers() {
    let mut graph = Graph::new();
    let id = graph.create(&[3], 1);
    graph.accumulate_grad(id, 2, 1.0).unwrap();
    graph.accumulate_grad_slice(id, &[1.0, 1.0, 1.0]).unwrap();
    assert_eq!(graph.get(id).unwrap().grad(), Some([1.0, 1.0, 2.0].as_slice()));

    graph.set_grad(id, &[0.5, 0.5, 0.5]).unwrap();
    assert_eq!(graph.get(id).unwrap().grad(), Some([0.5, 0.5, 0.5].as_slice()));

    graph.zero_grad(id).unwrap();
    assert_eq!(graph.get(id).unwrap().grad(), Some([0.0; 3].as_slice()));
}

#[test]
fn test_tensor_id_display() {
    let mut graph = Graph::new();
    let id = graph.create(&[1], 1);
    assert_eq!(id.to_string(), format!("#{}v{}", id.index(), id.generation()));
}
