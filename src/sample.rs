//! Numeric element types that pyramid reductions and rendering can operate on.
use std::borrow::Cow;

use zarrs::array::{DataType, ElementOwned};

/// A numeric array element with a lossless-enough round trip through `f64`.
pub trait Sample: ElementOwned + Copy + PartialOrd + Send + Sync + 'static {
    fn to_f64(self) -> f64;

    /// Convert back from `f64`, rounding half to even and saturating for integers.
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_sample_int {
    ($($t:ty),*) => {
        $(
            impl Sample for $t {
                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value.round_ties_even() as $t
                }
            }
        )*
    };
}

macro_rules! impl_sample_float {
    ($($t:ty),*) => {
        $(
            impl Sample for $t {
                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value as $t
                }
            }
        )*
    };
}

impl_sample_int!(u8, i8, u16, i16, u32, i32, u64, i64);
impl_sample_float!(f32, f64);

/// The Zarr V3 name of a data type, e.g. `"uint16"`.
pub fn data_type_name(data_type: &DataType) -> String {
    data_type
        .name_v3()
        .map_or_else(String::new, Cow::into_owned)
}

/// Call a function generic over [`Sample`] with the element type matching a data type.
/// Further generic arguments (usually `_`) are passed through.
///
/// ```ignore
/// dispatch_sample!(array.data_type(), read_plane::<T>(&array, &subset))
/// ```
macro_rules! dispatch_sample {
    ($data_type:expr, $func:ident::<T $(, $extra:ty)*>($($arg:expr),* $(,)?)) => {
        match $crate::sample::data_type_name($data_type).as_str() {
            "uint8" => $func::<u8 $(, $extra)*>($($arg),*),
            "int8" => $func::<i8 $(, $extra)*>($($arg),*),
            "uint16" => $func::<u16 $(, $extra)*>($($arg),*),
            "int16" => $func::<i16 $(, $extra)*>($($arg),*),
            "uint32" => $func::<u32 $(, $extra)*>($($arg),*),
            "int32" => $func::<i32 $(, $extra)*>($($arg),*),
            "uint64" => $func::<u64 $(, $extra)*>($($arg),*),
            "int64" => $func::<i64 $(, $extra)*>($($arg),*),
            "float32" => $func::<f32 $(, $extra)*>($($arg),*),
            "float64" => $func::<f64 $(, $extra)*>($($arg),*),
            other => Err($crate::Error::UnsupportedDataType {
                data_type: other.to_string(),
            }),
        }
    };
}

pub(crate) use dispatch_sample;
