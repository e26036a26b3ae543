#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::graph::{Module, NodeKind, NodeRef, TrainKind, Window};
    use crate::ir::Visibility;
    use crate::tensor::Type;

    #[test]
    fn test_fully_connected_creates_parameters() {
        let mut module = Module::new();
        let f = module.create_function("main").unwrap();
        let input = module
            .create_variable("input", Type::float(&[4, 2, 3]), Visibility::Public, TrainKind::None)
            .unwrap();

        let mut b = module.builder(f).unwrap();
        let fc = b.create_fully_connected("fc", input, 5).unwrap();
        assert_eq!(b.type_of(fc).unwrap().dims, vec![4, 5]);

        let weights = module.variable_by_name("fc.weights").unwrap();
        let bias = module.variable_by_name("fc.bias").unwrap();
        let weights = module.variable(weights).unwrap();
        assert_eq!(weights.ty.dims, vec![6, 5]);
        assert_eq!(weights.visibility, Visibility::Private);
        assert!(weights.is_trainable());
        let bound = (3.0f32 / 6.0).sqrt();
        assert!(weights.payload().data().iter().all(|x| x.abs() <= bound));

        let bias = module.variable(bias).unwrap();
        assert_eq!(bias.train, TrainKind::Broadcast(0.1));
        assert!(bias.payload().data().iter().all(|&x| x == 0.1));
    }

    #[test]
    fn test_same_seed_same_initializers() {
        let build = |seed| {
            let mut module = Module::with_seed(seed);
            let f = module.create_function("main").unwrap();
            let input = module
                .create_variable("input", Type::float(&[1, 8]), Visibility::Public, TrainKind::None)
                .unwrap();
            module.builder(f).unwrap().create_fully_connected("fc", input, 3).unwrap();
            let id = module.variable_by_name("fc.weights").unwrap();
            module.variable(id).unwrap().payload().to_vec()
        };
        assert_eq!(build(11), build(11));
        assert_ne!(build(11), build(12));
    }

    #[test]
    fn test_conv_and_pool_shapes() {
        let mut module = Module::new();
        let f = module.create_function("main").unwrap();
        let input = module
            .create_variable(
                "input",
                Type::float(&[2, 8, 8, 3]),
                Visibility::Public,
                TrainKind::None,
            )
            .unwrap();

        let mut b = module.builder(f).unwrap();
        let conv = b.create_conv("conv", input, 16, Window::new(5, 1, 2)).unwrap();
        assert_eq!(b.type_of(conv).unwrap().dims, vec![2, 8, 8, 16]);
        let pool = b.create_pool_max("pool", conv, Window::new(2, 2, 0)).unwrap();
        assert_eq!(b.type_of(pool).unwrap().dims, vec![2, 4, 4, 16]);

        let err = b.create_pool_avg("bad", pool, Window::new(9, 1, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidNode { .. }));

        let filter = module.variable_by_name("conv.filter").unwrap();
        assert_eq!(module.variable(filter).unwrap().ty.dims, vec![16, 5, 5, 3]);
    }

    #[test]
    fn test_shape_errors_are_rejected() {
        let mut module = Module::new();
        let f = module.create_function("main").unwrap();
        let a = module
            .create_variable("a", Type::float(&[2, 3]), Visibility::Public, TrainKind::None)
            .unwrap();
        let c = module
            .create_variable("c", Type::float(&[3, 2]), Visibility::Public, TrainKind::None)
            .unwrap();
        let labels = module
            .create_variable("labels", Type::float(&[2, 1]), Visibility::Public, TrainKind::None)
            .unwrap();

        let mut b = module.builder(f).unwrap();
        assert!(b.create_add("add", a, c).is_err());
        assert!(b.create_transpose("t", a, &[0, 0]).is_err());
        assert!(b.create_reshape("r", a, &[5]).is_err());
        // Labels must be index typed.
        assert!(b.create_softmax("sm", a, labels).is_err());

        let mm = b.create_matmul("mm", a, c).unwrap();
        assert_eq!(b.type_of(mm).unwrap().dims, vec![2, 2]);
        let t = b.create_transpose("t", a, &[1, 0]).unwrap();
        assert_eq!(b.type_of(t).unwrap().dims, vec![3, 2]);
    }

    #[test]
    fn test_duplicate_names() {
        let mut module = Module::new();
        module
            .create_variable("x", Type::float(&[1]), Visibility::Public, TrainKind::None)
            .unwrap();
        let err = module
            .create_variable("x", Type::float(&[1]), Visibility::Public, TrainKind::None)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));

        // Same type: reused. Different type: collision.
        let again = module
            .ensure_variable("x", Type::float(&[1]), Visibility::Private, TrainKind::None)
            .unwrap();
        assert_eq!(module.variable(again).unwrap().name, "x");
        assert!(module
            .ensure_variable("x", Type::float(&[2]), Visibility::Private, TrainKind::None)
            .is_err());

        module.create_function("main").unwrap();
        assert!(module.create_function("main").is_err());
    }

    #[test]
    fn test_node_names_are_uniquified() {
        let mut module = Module::new();
        let f = module.create_function("main").unwrap();
        let x = module
            .create_variable("x", Type::float(&[2]), Visibility::Public, TrainKind::None)
            .unwrap();
        let mut b = module.builder(f).unwrap();
        b.create_relu("act", x).unwrap();
        b.create_relu("act", x).unwrap();

        let function = module.function(f).unwrap();
        let names: Vec<&str> = function.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["act", "act1"]);
    }

    #[test]
    fn test_topo_order_and_dump() {
        let mut module = Module::new();
        let f = module.create_function("main").unwrap();
        let x = module
            .create_variable("x", Type::float(&[1, 4]), Visibility::Public, TrainKind::None)
            .unwrap();
        let mut b = module.builder(f).unwrap();
        let s = b.create_sigmoid("s", x).unwrap();
        let t = b.create_tanh("t", x).unwrap();
        let sum = b.create_add("sum", s, t).unwrap();
        b.create_save("out", sum).unwrap();

        let function = module.function(f).unwrap();
        let order: Vec<usize> = function.topo_order().unwrap().iter().map(|id| id.0).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(function.use_counts(), vec![1, 1, 1, 0]);

        let dump = function.dump();
        assert!(dump.contains("sigmoid"));
        assert!(dump.contains("save"));

        let save = function.node_by_name("out").unwrap();
        assert_eq!(save.kind, NodeKind::Save);
        assert!(save.ty.is_none());
        let dest = module.variable_by_name("out").unwrap();
        assert_eq!(save.inputs[1], NodeRef::Variable(dest));
        assert_eq!(module.variable(dest).unwrap().visibility, Visibility::Public);
    }

    #[test]
    fn test_save_to_checks_type() {
        let mut module = Module::new();
        let f = module.create_function("main").unwrap();
        let x = module
            .create_variable("x", Type::float(&[3]), Visibility::Public, TrainKind::None)
            .unwrap();
        let dest = module
            .create_variable("dest", Type::float(&[4]), Visibility::Public, TrainKind::None)
            .unwrap();
        let mut b = module.builder(f).unwrap();
        let r = b.create_relu("r", x).unwrap();
        assert!(b.create_save_to("save", r, dest).is_err());
    }

    #[test]
    fn test_quantized_nodes_carry_types() {
        let mut module = Module::new();
        let f = module.create_function("main").unwrap();
        let x = module
            .create_variable("x", Type::float(&[2, 2]), Visibility::Public, TrainKind::None)
            .unwrap();
        let mut b = module.builder(f).unwrap();
        let q = b.create_quantize("q", x, Type::quantized(&[2, 2], 0.1, 0)).unwrap();
        let r = b
            .create_rescale_quantized("r", q, Type::quantized(&[2, 2], 0.2, 1))
            .unwrap();
        let d = b.create_dequantize("d", r).unwrap();

        assert_eq!(b.type_of(r).unwrap().scale, 0.2);
        assert!(!b.type_of(d).unwrap().is_quantized());
        assert!(b.create_dequantize("bad", x).is_err());
    }
}
