//! Document model, binary codec, key encoding and JSON conversion.

mod codec;
pub mod json;
pub mod key;
mod object_id;
mod value;

pub use codec::{decode, encode, extract_field};
pub use object_id::ObjectId;
pub use value::{Document, Value};

/// Deepest nesting of documents and arrays the codec accepts. The top-level
/// document is depth 1.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Build a [`Document`] from `key => value` pairs.
///
/// ```
/// use simpledoc::doc;
///
/// let person = doc! { "name" => "Ada", "age" => 36 };
/// assert_eq!(person.len(), 2);
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::bson::Document::new()
    };
    ( $( $key:expr => $value:expr ),* $(,)? ) => {{
        let mut document = $crate::bson::Document::new();
        $( document.insert($key, $value); )*
        document
    }};
}
