use approx::assert_abs_diff_eq;

use super::random_array;
use crate::assert_err;
use crate::nn::{Function, Graph, GraphError, LSTM, TensorId};
use crate::tensor::NdArray;
use crate::utils::grad_check::{max_relative_error, numerical_gradient, weighted_sum};

const STEPS: usize = 3;

/// 整段序列前向后求`L = Σ_t Σ y_t·r_t`，然后逆序撤销并重置状态
fn sequence_loss(lstm: &mut LSTM, xs: &[NdArray], rs: &[Vec<f32>]) -> f32 {
    let mut graph = Graph::new();
    lstm.reset_state();
    let mut outputs: Vec<TensorId> = Vec::new();
    let mut loss = 0.0;
    for (x, r) in xs.iter().zip(rs) {
        let x = graph.insert(x.clone());
        let y = lstm.forward(&mut graph, &[x]).unwrap()[0];
        loss += weighted_sum(graph.get(y).unwrap().data(), r);
        outputs.push(y);
    }
    for &y in outputs.iter().rev() {
        lstm.discard(&mut graph, &[y]).unwrap();
    }
    lstm.reset_state();
    loss
}

fn sequence(batch: usize) -> (Vec<NdArray>, Vec<Vec<f32>>) {
    let xs = (0..STEPS)
        .map(|t| random_array(&[3], batch, 40 + t as u64))
        .collect();
    let rs = (0..STEPS)
        .map(|t| random_array(&[2], batch, 50 + t as u64).into_data())
        .collect();
    (xs, rs)
}

#[test]
fn test_lstm_output_shape_and_state() {
    let mut graph = Graph::new();
    let mut lstm = LSTM::new_seeded(3, 2, "lstm", 7);
    assert!(lstm.hidden().is_empty());

    let x = graph.insert(random_array(&[3], 4, 1));
    let y = lstm.forward(&mut graph, &[x]).unwrap()[0];
    assert_eq!(graph.get(y).unwrap().full_shape(), vec![4, 2]);
    assert_eq!(lstm.hidden(), graph.get(y).unwrap().data());
    assert_eq!(lstm.cell().len(), 8);
    assert_eq!(lstm.pending_backward(), 1);
}

#[test]
fn test_forget_gate_bias_starts_at_one() {
    let lstm = LSTM::new_seeded(3, 2, "lstm", 7);
    let bias = lstm.parameters()[2].data();
    assert_eq!(bias.len(), 8);
    assert_eq!(&bias[0..2], &[0.0, 0.0]);
    assert_eq!(&bias[2..4], &[1.0, 1.0]);
    assert_eq!(&bias[4..8], &[0.0; 4]);
}

#[test]
fn test_hidden_state_carries_across_steps() {
    let mut graph = Graph::new();
    let mut lstm = LSTM::new_seeded(3, 2, "lstm", 8);
    let x = graph.insert(random_array(&[3], 1, 2));

    let y1 = lstm.forward(&mut graph, &[x]).unwrap()[0];
    let y2 = lstm.forward(&mut graph, &[x]).unwrap()[0];
    let first = graph.get(y1).unwrap().data().to_vec();
    let second = graph.get(y2).unwrap().data().to_vec();
    assert_ne!(first, second);

    lstm.discard(&mut graph, &[y2]).unwrap();
    lstm.discard(&mut graph, &[y1]).unwrap();
    lstm.reset_state();
    let y = lstm.forward(&mut graph, &[x]).unwrap()[0];
    assert_abs_diff_eq!(graph.get(y).unwrap().data(), first.as_slice(), epsilon = 1e-7);
}

#[test]
fn test_batch_change_within_sequence() {
    let mut graph = Graph::new();
    let mut lstm = LSTM::new_seeded(3, 2, "lstm", 9);
    let x1 = graph.insert(random_array(&[3], 2, 3));
    let x2 = graph.insert(random_array(&[3], 3, 4));

    lstm.forward(&mut graph, &[x1]).unwrap();
    assert_err!(lstm.forward(&mut graph, &[x2]), GraphError::ShapeMismatch { .. });

    lstm.drop_pending(&mut graph).unwrap();
    lstm.reset_state();
    assert!(lstm.forward(&mut graph, &[x2]).is_ok());
}

#[test]
fn test_lstm_rejects_wrong_input_length() {
    let mut graph = Graph::new();
    let mut lstm = LSTM::new_seeded(3, 2, "lstm", 9);
    let x = graph.create(&[4], 1);
    assert_err!(
        lstm.forward(&mut graph, &[x]),
        GraphError::ShapeMismatch([3], [4], "lstm的输入长度须为3")
    );
}

/// 按时间步逆序反向传播（BPTT）的梯度与整段序列的数值梯度一致
#[test]
fn test_bptt_gradients() {
    let (xs, rs) = sequence(2);
    let mut lstm = LSTM::new_seeded(3, 2, "lstm", 10);

    let mut graph = Graph::new();
    lstm.reset_state();
    lstm.clear_grads();
    let inputs: Vec<TensorId> = xs.iter().map(|x| graph.insert(x.clone())).collect();
    let mut outputs = Vec::new();
    for &x in &inputs {
        outputs.push(lstm.forward(&mut graph, &[x]).unwrap()[0]);
    }
    for (&y, r) in outputs.iter().zip(&rs) {
        graph.set_grad(y, r).unwrap();
    }
    for &y in outputs.iter().rev() {
        lstm.backward(&mut graph, &[y]).unwrap();
    }
    assert_eq!(lstm.pending_backward(), 0);
    let analytic: Vec<Vec<f32>> = lstm.parameters().iter().map(|p| p.grad_or_zeros()).collect();
    let analytic_x0 = graph.get(inputs[0]).unwrap().grad_or_zeros();

    for (k, analytic) in analytic.iter().enumerate() {
        let original = lstm.parameters()[k].data().to_vec();
        let numeric = numerical_gradient(
            |v| {
                lstm.parameters_mut()[k].data_mut().copy_from_slice(v);
                sequence_loss(&mut lstm, &xs, &rs)
            },
            &original,
            1e-2,
        );
        lstm.parameters_mut()[k].data_mut().copy_from_slice(&original);
        let error = max_relative_error(analytic, &numeric);
        assert!(error < 1e-2, "第{k}个参数的梯度误差过大：{error}");
    }

    // 首步输入的梯度经由全部后续时间步传回
    let numeric = numerical_gradient(
        |v| {
            let mut perturbed = xs.clone();
            perturbed[0] = NdArray::from_batch(v, &[3], 2).unwrap();
            sequence_loss(&mut lstm, &perturbed, &rs)
        },
        xs[0].data(),
        1e-2,
    );
    let error = max_relative_error(&analytic_x0, &numeric);
    assert!(error < 1e-2, "首步输入的梯度误差过大：{error}");
}

#[test]
fn test_reset_state_clears_history() {
    let mut graph = Graph::new();
    let mut lstm = LSTM::new_seeded(3, 2, "lstm", 11);
    let x = graph.insert(random_array(&[3], 1, 5));
    let y = lstm.forward(&mut graph, &[x]).unwrap()[0];
    lstm.reset_state();

    assert!(lstm.hidden().is_empty());
    assert!(lstm.cell().is_empty());
    // 前向记录仍在，但逐步缓存已清空，反向失败且不改动梯度
    assert_err!(lstm.backward(&mut graph, &[y]), GraphError::InvalidOperation(_));
    assert!(lstm.parameters().iter().all(|p| p.grad().is_none()));
    lstm.drop_pending(&mut graph).unwrap();
    assert_eq!(lstm.pending_backward(), 0);
}
