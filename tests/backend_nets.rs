use approx::assert_abs_diff_eq;
use ferrox_ir::graph::LrnParams;
use ferrox_ir::{
    CompilationMode, Error, ExecutionEngine, FunctionId, NodeRef, Tensor, TrainKind, Type, VarId,
    Visibility, Window,
};

fn public(engine: &mut ExecutionEngine, name: &str, ty: Type) -> VarId {
    engine
        .module_mut()
        .create_variable(name, ty, Visibility::Public, TrainKind::None)
        .unwrap()
}

/// Build one function with `build`, compile it for inference and run it.
fn infer<F>(build: F, bindings: &[(&str, &Tensor)]) -> (ExecutionEngine, FunctionId)
where
    F: FnOnce(&mut ExecutionEngine, FunctionId),
{
    let mut engine = ExecutionEngine::default();
    let f = engine.module_mut().create_function("main").unwrap();
    build(&mut engine, f);
    engine.compile(CompilationMode::Infer, f).unwrap();
    engine.run(bindings).unwrap();
    (engine, f)
}

fn save(engine: &mut ExecutionEngine, f: FunctionId, value: NodeRef) {
    engine
        .module_mut()
        .builder(f)
        .unwrap()
        .create_save("result", value)
        .unwrap();
}

fn result(engine: &ExecutionEngine) -> Vec<f32> {
    engine.read("result").unwrap().to_vec()
}

#[test]
fn test_batched_add() {
    let batch = Tensor::from_f32(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let slice = Tensor::from_f32(&[3], vec![10.0, 20.0, 30.0]).unwrap();
    let (engine, _) = infer(
        |e, f| {
            let b = public(e, "batch", Type::float(&[2, 3]));
            let s = public(e, "slice", Type::float(&[3]));
            let out = e.module_mut().builder(f).unwrap().create_batched_add("add", b, s).unwrap();
            save(e, f, out);
        },
        &[("batch", &batch), ("slice", &slice)],
    );
    assert_eq!(result(&engine), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
}

#[test]
fn test_batched_reduce_add() {
    let batch = Tensor::from_f32(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let (engine, _) = infer(
        |e, f| {
            let b = public(e, "batch", Type::float(&[2, 3]));
            let out = e
                .module_mut()
                .builder(f)
                .unwrap()
                .create_batched_reduce_add("reduce", b)
                .unwrap();
            save(e, f, out);
        },
        &[("batch", &batch)],
    );
    assert_eq!(result(&engine), vec![5.0, 7.0, 9.0]);
}

#[test]
fn test_matmul() {
    let lhs = Tensor::from_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let rhs = Tensor::from_f32(&[2, 2], vec![5.0, 6.0, 7.0, 8.0]).unwrap();
    let (engine, _) = infer(
        |e, f| {
            let l = public(e, "lhs", Type::float(&[2, 2]));
            let r = public(e, "rhs", Type::float(&[2, 2]));
            let out = e.module_mut().builder(f).unwrap().create_matmul("mm", l, r).unwrap();
            save(e, f, out);
        },
        &[("lhs", &lhs), ("rhs", &rhs)],
    );
    assert_eq!(result(&engine), vec![19.0, 22.0, 43.0, 50.0]);
}

#[test]
fn test_fully_connected_with_parameters() {
    let input = Tensor::from_f32(&[2, 3], vec![1.0, 2.0, 3.0, 0.0, -1.0, 1.0]).unwrap();
    let (engine, _) = infer(
        |e, f| {
            let x = public(e, "input", Type::float(&[2, 3]));
            let w = public(e, "w", Type::float(&[3, 2]));
            let b = public(e, "b", Type::float(&[2]));
            let module = e.module_mut();
            module
                .set_payload(
                    w,
                    Tensor::from_f32(&[3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap(),
                )
                .unwrap();
            module.fill_payload(b, 0.5).unwrap();
            let out = module
                .builder(f)
                .unwrap()
                .create_fully_connected_with("fc", x, w, b)
                .unwrap();
            save(e, f, out);
        },
        &[("input", &input)],
    );
    // [1 + 3, 2 + 3] and [0 + 1, -1 + 1], plus the bias.
    assert_eq!(result(&engine), vec![4.5, 5.5, 1.5, 0.5]);
}

#[test]
fn test_activations() {
    let input = Tensor::from_f32(&[1, 3], vec![-1.0, 0.0, 2.0]).unwrap();
    let mut engine = ExecutionEngine::default();
    let f = engine.module_mut().create_function("main").unwrap();
    let x = public(&mut engine, "x", Type::float(&[1, 3]));
    {
        let mut b = engine.module_mut().builder(f).unwrap();
        let r = b.create_relu("relu", x).unwrap();
        let s = b.create_sigmoid("sigmoid", x).unwrap();
        let t = b.create_tanh("tanh", x).unwrap();
        b.create_save("relu_out", r).unwrap();
        b.create_save("sigmoid_out", s).unwrap();
        b.create_save("tanh_out", t).unwrap();
    }
    engine.compile(CompilationMode::Infer, f).unwrap();
    engine.run(&[("x", &input)]).unwrap();

    assert_eq!(engine.read("relu_out").unwrap().to_vec(), vec![0.0, 0.0, 2.0]);
    let sigmoid = engine.read("sigmoid_out").unwrap().to_vec();
    for (got, x) in sigmoid.into_iter().zip([-1.0f32, 0.0, 2.0]) {
        assert_abs_diff_eq!(got, 1.0 / (1.0 + (-x).exp()), epsilon = 1e-6);
    }
    for (got, x) in engine.read("tanh_out").unwrap().to_vec().into_iter().zip([-1.0f32, 0.0, 2.0]) {
        assert_abs_diff_eq!(got, x.tanh(), epsilon = 1e-6);
    }
}

#[test]
fn test_max_min_select() {
    let lhs = Tensor::from_f32(&[3], vec![1.0, 5.0, 3.0]).unwrap();
    let rhs = Tensor::from_f32(&[3], vec![4.0, 2.0, 6.0]).unwrap();
    let cond = Tensor::from_f32(&[3], vec![1.0, 0.0, 1.0]).unwrap();
    let mut engine = ExecutionEngine::default();
    let f = engine.module_mut().create_function("main").unwrap();
    let l = public(&mut engine, "lhs", Type::float(&[3]));
    let r = public(&mut engine, "rhs", Type::float(&[3]));
    let c = public(&mut engine, "cond", Type::float(&[3]));
    {
        let mut b = engine.module_mut().builder(f).unwrap();
        let max = b.create_max("max", l, r).unwrap();
        let min = b.create_min("min", l, r).unwrap();
        let sel = b.create_select("select", c, max, min).unwrap();
        b.create_save("max_out", max).unwrap();
        b.create_save("min_out", min).unwrap();
        b.create_save("select_out", sel).unwrap();
    }
    engine.compile(CompilationMode::Infer, f).unwrap();
    engine.run(&[("lhs", &lhs), ("rhs", &rhs), ("cond", &cond)]).unwrap();

    assert_eq!(engine.read("max_out").unwrap().to_vec(), vec![4.0, 5.0, 6.0]);
    assert_eq!(engine.read("min_out").unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
    assert_eq!(engine.read("select_out").unwrap().to_vec(), vec![4.0, 2.0, 6.0]);
}

#[test]
fn test_reshape_then_transpose() {
    let input = Tensor::from_f32(&[2, 3], (0..6).map(|v| v as f32).collect()).unwrap();
    let (engine, _) = infer(
        |e, f| {
            let x = public(e, "x", Type::float(&[2, 3]));
            let mut b = e.module_mut().builder(f).unwrap();
            let r = b.create_reshape("reshape", x, &[3, 2]).unwrap();
            let t = b.create_transpose("transpose", r, &[1, 0]).unwrap();
            save(e, f, t);
        },
        &[("x", &input)],
    );
    assert_eq!(engine.read("result").unwrap().dims(), &[2, 3]);
    assert_eq!(result(&engine), vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
}

#[test]
fn test_gather_and_out_of_range_index() {
    let data = Tensor::from_f32(&[3, 2], (0..6).map(|v| v as f32).collect()).unwrap();
    let indices = Tensor::from_indices(&[2], &[2, 0]).unwrap();
    let (mut engine, _) = infer(
        |e, f| {
            let d = public(e, "data", Type::float(&[3, 2]));
            let i = public(e, "indices", Type::index(&[2]));
            let out = e.module_mut().builder(f).unwrap().create_gather("gather", d, i).unwrap();
            save(e, f, out);
        },
        &[("data", &data), ("indices", &indices)],
    );
    assert_eq!(result(&engine), vec![4.0, 5.0, 0.0, 1.0]);

    let bad = Tensor::from_indices(&[2], &[1, 3]).unwrap();
    let err = engine.run(&[("indices", &bad)]).unwrap_err();
    assert!(matches!(err, Error::Kernel { .. }));
}

#[test]
fn test_pooling() {
    let input = Tensor::from_f32(&[1, 4, 4, 1], (0..16).map(|v| v as f32).collect()).unwrap();
    let mut engine = ExecutionEngine::default();
    let f = engine.module_mut().create_function("main").unwrap();
    let x = public(&mut engine, "x", Type::float(&[1, 4, 4, 1]));
    {
        let mut b = engine.module_mut().builder(f).unwrap();
        let max = b.create_pool_max("max", x, Window::new(2, 2, 0)).unwrap();
        let avg = b.create_pool_avg("avg", x, Window::new(2, 2, 0)).unwrap();
        b.create_save("max_out", max).unwrap();
        b.create_save("avg_out", avg).unwrap();
    }
    engine.compile(CompilationMode::Infer, f).unwrap();
    engine.run(&[("x", &input)]).unwrap();

    assert_eq!(engine.read("max_out").unwrap().to_vec(), vec![5.0, 7.0, 13.0, 15.0]);
    assert_eq!(engine.read("avg_out").unwrap().to_vec(), vec![2.5, 4.5, 10.5, 12.5]);
}

#[test]
fn test_softmax_rows() {
    let input = Tensor::from_f32(&[2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 4.0]).unwrap();
    let (engine, _) = infer(
        |e, f| {
            let x = public(e, "x", Type::float(&[2, 3]));
            let labels = public(e, "labels", Type::index(&[2, 1]));
            let out = e.module_mut().builder(f).unwrap().create_softmax("sm", x, labels).unwrap();
            save(e, f, out);
        },
        &[("x", &input)],
    );
    let values = result(&engine);
    assert_abs_diff_eq!(values[..3].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(values[3..].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    assert!(values[2] > values[1] && values[1] > values[0]);
}

#[test]
fn test_quantize_rescale_dequantize() {
    let input = Tensor::from_f32(&[4], vec![0.5, 1.0, -1.25, 100.0]).unwrap();
    let (engine, _) = infer(
        |e, f| {
            let x = public(e, "x", Type::float(&[4]));
            let mut b = e.module_mut().builder(f).unwrap();
            let q = b.create_quantize("q", x, Type::quantized(&[4], 0.25, 0)).unwrap();
            let r = b
                .create_rescale_quantized("rescale", q, Type::quantized(&[4], 0.5, 1))
                .unwrap();
            let d = b.create_dequantize("dq", r).unwrap();
            save(e, f, d);
        },
        &[("x", &input)],
    );
    // 100.0 saturates at 127 * 0.25; -1.25 lands halfway and rounds away from zero.
    assert_eq!(result(&engine), vec![0.5, 1.0, -1.5, 32.0]);
}

#[test]
fn test_local_response_normalization() {
    let input = Tensor::from_f32(&[1, 1, 1, 3], vec![1.0, 2.0, 3.0]).unwrap();
    let params = LrnParams {
        half_window: 1,
        alpha: 3.0,
        beta: 1.0,
        k: 1.0,
    };
    let (engine, _) = infer(
        |e, f| {
            let x = public(e, "x", Type::float(&[1, 1, 1, 3]));
            let out = e
                .module_mut()
                .builder(f)
                .unwrap()
                .create_local_response_normalization("lrn", x, params)
                .unwrap();
            save(e, f, out);
        },
        &[("x", &input)],
    );
    let values = result(&engine);
    assert_abs_diff_eq!(values[0], 1.0 / 6.0, epsilon = 1e-6);
    assert_abs_diff_eq!(values[1], 2.0 / 15.0, epsilon = 1e-6);
    assert_abs_diff_eq!(values[2], 3.0 / 14.0, epsilon = 1e-6);
}

#[test]
fn test_convolution() {
    let input = Tensor::from_f32(&[1, 3, 3, 1], (1..=9).map(|v| v as f32).collect()).unwrap();
    let (engine, _) = infer(
        |e, f| {
            let x = public(e, "x", Type::float(&[1, 3, 3, 1]));
            let filter = public(e, "filter", Type::float(&[1, 2, 2, 1]));
            let bias = public(e, "bias", Type::float(&[1]));
            let module = e.module_mut();
            module.fill_payload(filter, 1.0).unwrap();
            let out = module
                .builder(f)
                .unwrap()
                .create_conv_with("conv", x, filter, bias, Window::new(2, 1, 0))
                .unwrap();
            save(e, f, out);
        },
        &[("x", &input)],
    );
    assert_eq!(engine.read("result").unwrap().dims(), &[1, 2, 2, 1]);
    assert_eq!(result(&engine), vec![12.0, 16.0, 24.0, 28.0]);
}

#[test]
fn test_in_place_activations_share_storage() {
    let input = Tensor::from_f32(&[1, 3], vec![-2.0, 0.0, 2.0]).unwrap();
    let build = |in_place: bool| {
        let mut engine = ExecutionEngine::default();
        let f = engine.module_mut().create_function("main").unwrap();
        let x = public(&mut engine, "x", Type::float(&[1, 3]));
        let module = engine.module_mut();
        module.function_mut(f).unwrap().set_in_place(in_place);
        let mut b = module.builder(f).unwrap();
        let s = b.create_sigmoid("sigmoid", x).unwrap();
        let r = b.create_relu("relu", s).unwrap();
        let t = b.create_tanh("tanh", r).unwrap();
        b.create_save("result", t).unwrap();
        engine.compile(CompilationMode::Infer, f).unwrap();
        engine.run(&[("x", &input)]).unwrap();
        engine
    };

    let plain = build(false);
    let shared = build(true);
    let activations = |e: &ExecutionEngine| {
        e.unit(CompilationMode::Infer)
            .unwrap()
            .function()
            .activations()
            .len()
    };
    assert_eq!(activations(&plain), 3);
    assert_eq!(activations(&shared), 1);
    assert_eq!(result(&plain), result(&shared));
}
