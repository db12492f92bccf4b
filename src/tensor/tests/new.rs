use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::assert_err;
use crate::errors::GraphError;
use crate::tensor::NdArray;

#[test]
fn test_new_is_zeroed_leaf() {
    let array = NdArray::new(&[2, 3], 4);
    assert_eq!(array.data(), &[0.0; 24]);
    assert_eq!(array.length(), 6);
    assert_eq!(array.batch_count(), 4);
    assert!(array.is_leaf());
    assert_eq!(array.use_count(), 0);
    assert!(array.grad().is_none());
}

#[test]
fn test_from_data_checks_length() {
    let array = NdArray::from_data(&[1., 2., 3., 4.], &[2, 2]).unwrap();
    assert_eq!(array.shape(), &[2, 2]);
    assert_eq!(array.batch_count(), 1);

    assert_err!(
        NdArray::from_batch(&[1., 2., 3.], &[2], 2),
        GraphError::ShapeMismatch { expected, got, .. } if expected == &[4] && got == &[3]
    );
}

#[test]
fn test_wrap_keeps_buffer_and_parent() {
    let id = crate::nn::FunctionId::next();
    let array = NdArray::wrap(vec![1., 2.], &[1], 2, Some(id)).unwrap();
    assert_eq!(array.parent(), Some(id));
    assert!(!array.is_leaf());
    assert_eq!(array.into_data(), vec![1., 2.]);
}

#[test]
fn test_normal_with_rng_is_reproducible() {
    let a = NdArray::normal_with_rng(0.0, 1.0, &[3, 5], &mut StdRng::seed_from_u64(42));
    let b = NdArray::normal_with_rng(0.0, 1.0, &[3, 5], &mut StdRng::seed_from_u64(42));
    assert!(a.same_values(&b));
    assert!(a.data().iter().all(|x| x.is_finite()));

    let big = NdArray::normal_with_rng(2.0, 0.5, &[10000], &mut StdRng::seed_from_u64(7));
    let mean = big.data().iter().sum::<f32>() / 10000.0;
    assert!((mean - 2.0).abs() < 0.05);
}

#[test]
fn test_uniform_with_rng_range() {
    let array = NdArray::uniform_with_rng(-1.0, 1.0, &[100], &mut StdRng::seed_from_u64(1));
    assert!(array.data().iter().all(|x| (-1.0..=1.0).contains(x)));
}
