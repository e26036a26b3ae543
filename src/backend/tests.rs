#[cfg(test)]
mod tests {
    use crate::backend::kernels::{
        convolution, matrix, normalization, pooling, quantization, sgd,
    };
    use crate::backend::{Backend, BackendKind, Interpreter, create_backend};
    use crate::error::Error;
    use crate::graph::{LrnParams, SgdParams, Window};
    use crate::ir::{
        InstrKind, Instruction, IrFunction, Mutability, StorageArena, Value, Visibility,
    };
    use crate::tensor::{Tensor, Type};
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};

    fn array(dims: &[usize], values: Vec<f32>) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(dims), values).unwrap()
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let input = array(&[2, 3], vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0]);
        let out = normalization::softmax(&input).unwrap();
        for row in out.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        // Large inputs must not overflow.
        assert_abs_diff_eq!(out[[1, 0]], 1.0 / 3.0, epsilon = 1e-6);
        assert!(out[[0, 2]] > out[[0, 1]]);
    }

    #[test]
    fn test_softmax_grad_subtracts_one_hot() {
        let output = array(&[2, 2], vec![0.25, 0.75, 0.5, 0.5]);
        let selected = array(&[2, 1], vec![1.0, 0.0]);
        let grad = normalization::softmax_grad(&output, &selected).unwrap();
        assert_eq!(grad.iter().copied().collect::<Vec<_>>(), vec![0.25, -0.25, -0.5, 0.5]);

        let bad = array(&[2, 1], vec![2.0, 0.0]);
        assert!(normalization::softmax_grad(&output, &bad).is_err());
    }

    #[test]
    fn test_pooling_forward_and_backward() {
        let input = array(&[1, 2, 2, 1], vec![1.0, 3.0, 2.0, 4.0]);
        let window = Window::new(2, 1, 0);

        let max = pooling::pool_max(&input, window).unwrap();
        assert_eq!(max.shape(), &[1, 1, 1, 1]);
        assert_eq!(max.iter().next().copied(), Some(4.0));

        let avg = pooling::pool_avg(&input, window).unwrap();
        assert_abs_diff_eq!(avg.iter().next().copied().unwrap(), 2.5);

        let out_grad = array(&[1, 1, 1, 1], vec![1.0]);
        let max_grad = pooling::pool_max_grad(&input, &out_grad, window).unwrap();
        assert_eq!(max_grad.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 0.0, 1.0]);

        let avg_grad = pooling::pool_avg_grad(&[1, 2, 2, 1], &out_grad, window).unwrap();
        assert!(avg_grad.iter().all(|&g| (g - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_pool_avg_counts_padding() {
        let input = array(&[1, 2, 2, 1], vec![1.0, 3.0, 2.0, 4.0]);
        let out = pooling::pool_avg(&input, Window::new(2, 2, 1)).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 1]);
        // Only one real tap per window, divided by the full kernel area.
        let values: Vec<f32> = out.iter().copied().collect();
        assert_eq!(values, vec![0.25, 0.75, 0.5, 1.0]);
    }

    #[test]
    fn test_convolution_matches_hand_computation() {
        let input = array(&[1, 2, 2, 1], vec![1.0, 2.0, 3.0, 4.0]);
        let filter = array(&[1, 2, 2, 1], vec![1.0; 4]);
        let bias = array(&[1], vec![0.5]);

        let out = convolution::convolution(&input, &filter, &bias, Window::new(2, 1, 0)).unwrap();
        assert_eq!(out.shape(), &[1, 1, 1, 1]);
        assert_abs_diff_eq!(out.iter().next().copied().unwrap(), 10.5);

        let padded =
            convolution::convolution(&input, &filter, &bias, Window::new(2, 1, 1)).unwrap();
        assert_eq!(padded.shape(), &[1, 3, 3, 1]);
        assert_abs_diff_eq!(padded[[0, 0, 0, 0]], 1.5);
        assert_abs_diff_eq!(padded[[0, 1, 1, 0]], 10.5);
        assert_abs_diff_eq!(padded[[0, 2, 2, 0]], 4.5);
    }

    #[test]
    fn test_convolution_gradients() {
        let input = array(&[1, 2, 2, 1], vec![1.0, 2.0, 3.0, 4.0]);
        let filter = array(&[1, 2, 2, 1], vec![1.0, -1.0, 2.0, 0.5]);
        let out_grad = array(&[1, 1, 1, 1], vec![2.0]);
        let window = Window::new(2, 1, 0);

        let input_grad =
            convolution::convolution_input_grad(&[1, 2, 2, 1], &filter, &out_grad, window).unwrap();
        assert_eq!(
            input_grad.iter().copied().collect::<Vec<_>>(),
            vec![2.0, -2.0, 4.0, 1.0]
        );

        let filter_grad =
            convolution::convolution_filter_grad(&input, &[1, 2, 2, 1], &out_grad, window).unwrap();
        assert_eq!(
            filter_grad.iter().copied().collect::<Vec<_>>(),
            vec![2.0, 4.0, 6.0, 8.0]
        );

        let wrong_channels = array(&[1, 2, 2, 2], vec![0.0; 8]);
        let bias = array(&[1], vec![0.0]);
        assert!(convolution::convolution(&input, &wrong_channels, &bias, window).is_err());
    }

    #[test]
    fn test_sgd_momentum_and_decay() {
        let params = SgdParams {
            learning_rate: 0.03,
            momentum: 0.3,
            l2_decay: 0.01,
        };
        let weight = array(&[1], vec![2.0]);
        let grad = array(&[1], vec![0.5]);
        let velocity = array(&[1], vec![0.0]);

        let (w, v) = sgd::sgd(&weight, &grad, &velocity, &params).unwrap();
        assert_abs_diff_eq!(v[[0]], -0.0156, epsilon = 1e-6);
        assert_abs_diff_eq!(w[[0]], 1.9844, epsilon = 1e-6);

        // The previous velocity is carried with the momentum factor.
        let (_, v2) = sgd::sgd(&w, &grad, &v, &params).unwrap();
        let expected: f32 = 0.3 * -0.0156 - 0.03 * (0.5 + 0.01 * 1.9844);
        assert_abs_diff_eq!(v2[[0]], expected, epsilon = 1e-6);

        assert!(sgd::sgd(&weight, &array(&[2], vec![0.0; 2]), &velocity, &params).is_err());
    }

    #[test]
    fn test_lrn_single_channel() {
        let params = LrnParams {
            half_window: 0,
            alpha: 1.0,
            beta: 1.0,
            k: 1.0,
        };
        let input = array(&[1, 1, 1, 1], vec![2.0]);
        let out = normalization::local_response_normalization(&input, &params).unwrap();
        // 2 / (1 + 2^2)
        assert_abs_diff_eq!(out[[0, 0, 0, 0]], 0.4, epsilon = 1e-6);

        let grad = normalization::local_response_normalization_grad(
            &input,
            &out,
            &array(&[1, 1, 1, 1], vec![1.0]),
            &params,
        )
        .unwrap();
        // d/dx x / (1 + x^2) = (1 - x^2) / (1 + x^2)^2
        assert_abs_diff_eq!(grad[[0, 0, 0, 0]], -0.12, epsilon = 1e-6);
    }

    #[test]
    fn test_matrix_kernels() {
        let x = array(&[2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let w = array(&[2, 1], vec![1.0, 1.0]);
        let b = array(&[1], vec![0.5]);
        let fc = matrix::fully_connected(&x, &w, &b).unwrap();
        assert_eq!(fc.shape(), &[2, 1]);
        assert_eq!(fc.iter().copied().collect::<Vec<_>>(), vec![3.5, 7.5]);

        let m = array(&[2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let t = matrix::transpose(&m, &[1, 0]).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(matrix::transpose(&m, &[0, 0]).is_err());

        let reduced = matrix::batched_reduce_add(&m).unwrap();
        assert_eq!(reduced.iter().copied().collect::<Vec<_>>(), vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_gather_rejects_out_of_range() {
        let data = array(&[3, 2], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let rows = matrix::gather(&data, &array(&[2], vec![2.0, 0.0])).unwrap();
        assert_eq!(rows.shape(), &[2, 2]);
        assert_eq!(rows.iter().copied().collect::<Vec<_>>(), vec![4.0, 5.0, 0.0, 1.0]);

        let err = matrix::gather(&data, &array(&[1], vec![3.0])).unwrap_err();
        assert!(err.contains("out of range"));
    }

    #[test]
    fn test_quantization_round_trip_and_saturation() {
        let ty = Type::quantized(&[3], 0.5, 2);
        assert_eq!(quantization::quantize_value(1.0, &ty), 4.0);
        assert_eq!(quantization::quantize_value(100.0, &ty), 127.0);
        assert_eq!(quantization::quantize_value(-100.0, &ty), -128.0);

        let stored = quantization::store(array(&[3], vec![1.0, -1.0, 0.0]), &ty);
        let tensor = Tensor::from_array(ty, stored).unwrap();
        let real = quantization::real(&tensor);
        assert_eq!(real.iter().copied().collect::<Vec<_>>(), vec![1.0, -1.0, 0.0]);
    }

    #[test]
    fn test_interpreter_runs_function() {
        let mut weights = StorageArena::new();
        let input = weights
            .create_with_payload(
                "input",
                Type::float(&[1, 4]),
                Mutability::Mutable,
                Visibility::Public,
                Tensor::from_f32(&[1, 4], vec![-1.0, 2.0, -3.0, 4.0]).unwrap(),
            )
            .unwrap();
        let result = weights
            .create("result", Type::float(&[1, 4]), Mutability::Mutable, Visibility::Public)
            .unwrap();

        let mut function = IrFunction::new("relu");
        let act = function.create_activation("relu", Type::float(&[1, 4])).unwrap();
        function
            .push(
                &weights,
                Instruction::new("relu", InstrKind::Relu, &[act, Value::Weight(input)]),
            )
            .unwrap();
        function
            .push(
                &weights,
                Instruction::new("save", InstrKind::Copy, &[Value::Weight(result), act]),
            )
            .unwrap();

        let mut backend = Interpreter::new();
        backend.execute(&mut function, &mut weights).unwrap();
        assert_eq!(backend.executed(), 2);
        assert_eq!(
            weights.get(result).unwrap().payload().to_vec(),
            vec![0.0, 2.0, 0.0, 4.0]
        );
    }

    #[test]
    fn test_interpreter_refuses_frozen_destination() {
        let mut weights = StorageArena::new();
        let src = weights
            .create("src", Type::float(&[2]), Mutability::Mutable, Visibility::Public)
            .unwrap();
        let dst = weights
            .create("dst", Type::float(&[2]), Mutability::Mutable, Visibility::Public)
            .unwrap();

        let mut function = IrFunction::new("copy");
        function
            .push(
                &weights,
                Instruction::new(
                    "copy",
                    InstrKind::Copy,
                    &[Value::Weight(dst), Value::Weight(src)],
                ),
            )
            .unwrap();

        // Freezing after lowering must still protect the location at run time.
        weights.set_mutability(dst, Mutability::Constant).unwrap();
        let mut backend = create_backend(BackendKind::Interpreter);
        assert_eq!(backend.name(), "interpreter");
        let err = backend.execute(&mut function, &mut weights).unwrap_err();
        assert!(matches!(err, Error::ConstantWrite { .. }));
    }
}
