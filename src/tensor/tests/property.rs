use crate::assert_err;
use crate::errors::GraphError;
use crate::tensor::NdArray;

#[test]
fn test_full_shape_and_view() {
    let array = NdArray::from_batch(&[1., 2., 3., 4., 5., 6.], &[3], 2).unwrap();
    assert_eq!(array.full_shape(), vec![2, 3]);
    assert_eq!(array.dimension(), 1);
    let view = array.view().unwrap();
    assert_eq!(view.shape(), &[2, 3]);
    assert_eq!(view[[1, 0]], 4.);
}

#[test]
fn test_sample() {
    let array = NdArray::from_batch(&[1., 2., 3., 4.], &[2], 2).unwrap();
    assert_eq!(array.sample(0), &[1., 2.]);
    assert_eq!(array.sample(1), &[3., 4.]);
}

#[test]
fn test_compare_shapes() {
    let a = NdArray::from_data(&[1., 2., 3., 4.], &[1, 4]).unwrap();
    let b = NdArray::from_data(&[1., 2., 3., 4.], &[4]).unwrap();
    assert!(!a.is_same_shape(&b));
    assert!(!a.same_values(&b));
    assert!(a.is_same_shape(&a.clone()));
}

#[test]
fn test_reshape_moves_buffer() {
    let array = NdArray::from_data(&[1., 2., 3., 4., 5., 6.], &[6]).unwrap();
    let reshaped = array.reshape(&[2, 3, 1, 1]).unwrap();
    assert_eq!(reshaped.shape(), &[2, 3, 1, 1]);
    assert_eq!(reshaped.length(), 6);
    assert_eq!(reshaped.data(), &[1., 2., 3., 4., 5., 6.]);

    let mut array = NdArray::new(&[6], 1);
    assert_err!(
        array.reshape_mut(&[4]),
        GraphError::ShapeMismatch([6], [4], "重塑前后元素个数须一致：6 vs 4")
    );
    assert_eq!(array.shape(), &[6]);
}
