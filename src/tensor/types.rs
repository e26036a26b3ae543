use std::fmt;

/// Element kind of a tensor or storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    /// 32 bit float.
    Float,
    /// 8 bit signed integer, quantized with a scale and an offset.
    Int8Q,
    /// Integer index (labels, gather indices).
    Index,
}

impl ElemKind {
    pub fn is_quantized(self) -> bool {
        matches!(self, ElemKind::Int8Q)
    }
}

impl fmt::Display for ElemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemKind::Float => write!(f, "float"),
            ElemKind::Int8Q => write!(f, "i8q"),
            ElemKind::Index => write!(f, "index"),
        }
    }
}

/// Resolved type of a value: element kind, dimensions and, for quantized
/// kinds, the scale/offset pair mapping stored integers to real values
/// (`real = scale * (q - offset)`).
#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    pub elem: ElemKind,
    pub dims: Vec<usize>,
    pub scale: f32,
    pub offset: i32,
}

impl Type {
    pub fn new(elem: ElemKind, dims: &[usize]) -> Self {
        Self {
            elem,
            dims: dims.to_vec(),
            scale: 1.0,
            offset: 0,
        }
    }

    pub fn float(dims: &[usize]) -> Self {
        Self::new(ElemKind::Float, dims)
    }

    pub fn index(dims: &[usize]) -> Self {
        Self::new(ElemKind::Index, dims)
    }

    pub fn quantized(dims: &[usize], scale: f32, offset: i32) -> Self {
        Self {
            elem: ElemKind::Int8Q,
            dims: dims.to_vec(),
            scale,
            offset,
        }
    }

    /// Same element kind (and quantization parameters) with other dimensions.
    pub fn with_dims(&self, dims: &[usize]) -> Self {
        Self {
            elem: self.elem,
            dims: dims.to_vec(),
            scale: self.scale,
            offset: self.offset,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_quantized(&self) -> bool {
        self.elem.is_quantized()
    }

    /// Size of one row along the leading dimension.
    pub fn slice_size(&self) -> usize {
        self.dims.iter().skip(1).product()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        if self.is_quantized() {
            write!(
                f,
                "{}<{}; scale={}, offset={}>",
                self.elem,
                dims.join(" x "),
                self.scale,
                self.offset
            )
        } else {
            write!(f, "{}<{}>", self.elem, dims.join(" x "))
        }
    }
}
