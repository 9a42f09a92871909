pub mod dataset;
pub mod interval;
pub mod primitive;
pub mod tree;
pub mod value;

pub use dataset::{DEFAULT_LABEL, DatasetInfo, MetricPoint, SourceFile};
pub use interval::{Interval, IntervalSide};
pub use primitive::{Primitive, PrimitiveLink};
pub use tree::TreeNode;
pub use value::AttrValue;
