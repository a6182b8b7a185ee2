//! Protocol messages of the aggregation operator
//!
//! The query optimizer ships the aggregation operator to the workers as an
//! [`AggregationOperationState`] message. Messages are validated with the
//! `*_proto_is_valid` functions before they are reconstructed, see [`from_proto`]

pub mod from_proto;

/// Type id of the value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TypeId {
    /// 32 bits signed integer
    Int = 0,
    /// 64 bits signed integer
    Long = 1,
    /// 32 bits float
    Float = 2,
    /// 64 bits float
    Double = 3,
    /// Variable length string
    VarChar = 4,
}

/// Operation of the binary scalar expression
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum BinaryOperationId {
    /// `+`
    Add = 0,
    /// `-`
    Subtract = 1,
    /// `*`
    Multiply = 2,
}

/// Comparison operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ComparisonId {
    /// `=`
    Equal = 0,
    /// `!=`
    NotEqual = 1,
    /// `<`
    Less = 2,
    /// `<=`
    LessOrEqual = 3,
    /// `>`
    Greater = 4,
    /// `>=`
    GreaterOrEqual = 5,
}

/// Aggregate function
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AggregationId {
    /// AVG
    Avg = 0,
    /// COUNT
    Count = 1,
    /// MAX
    Max = 2,
    /// MIN
    Min = 3,
    /// SUM
    Sum = 4,
}

/// Implementation of the hash table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HashTableImplType {
    /// Separate chaining hash table
    SeparateChaining = 0,
    /// Separate chaining hash table keyed by a single integer
    SimpleScalarSeparateChaining = 1,
}

/// Kind of the scalar expression
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ScalarType {
    /// Constant value
    Literal = 0,
    /// Reference to the attribute
    Attribute = 1,
    /// Arithmetic between two scalars
    BinaryExpression = 2,
}

/// Kind of the predicate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PredicateType {
    /// Always true
    True = 0,
    /// Always false
    False = 1,
    /// Comparison between two scalars
    Comparison = 2,
    /// Conjunction of the operands
    Conjunction = 3,
    /// Disjunction of the operands
    Disjunction = 4,
    /// Negation of the single operand
    Negation = 5,
}

/// Type of the column
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Type {
    /// [`TypeId`] of the type
    #[prost(enumeration = "TypeId", tag = "1")]
    pub type_id: i32,
    /// Nullability
    #[prost(bool, tag = "2")]
    pub nullable: bool,
    /// Max length of the VarChar
    #[prost(uint64, tag = "3")]
    pub max_length: u64,
}

/// Single datum
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypedValue {
    /// [`TypeId`] of the datum
    #[prost(enumeration = "TypeId", tag = "1")]
    pub type_id: i32,
    /// The datum, `None` is NULL
    #[prost(oneof = "typed_value::Value", tags = "2, 3, 4, 5, 6")]
    pub value: Option<typed_value::Value>,
}

/// Nested message and enum types in `TypedValue`
pub mod typed_value {
    /// Datum of the [`TypedValue`](super::TypedValue)
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        /// Int datum
        #[prost(int32, tag = "2")]
        IntValue(i32),
        /// Long datum
        #[prost(int64, tag = "3")]
        LongValue(i64),
        /// Float datum
        #[prost(float, tag = "4")]
        FloatValue(f32),
        /// Double datum
        #[prost(double, tag = "5")]
        DoubleValue(f64),
        /// VarChar datum
        #[prost(string, tag = "6")]
        VarCharValue(String),
    }
}

/// Scalar expression
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Scalar {
    /// [`ScalarType`] of the expression
    #[prost(enumeration = "ScalarType", tag = "1")]
    pub scalar_type: i32,
    /// Value of the literal
    #[prost(message, optional, tag = "2")]
    pub literal: Option<TypedValue>,
    /// Type of the literal
    #[prost(message, optional, tag = "3")]
    pub literal_type: Option<Type>,
    /// Relation of the attribute
    #[prost(uint32, tag = "4")]
    pub relation_id: u32,
    /// Id of the attribute
    #[prost(uint32, tag = "5")]
    pub attribute_id: u32,
    /// [`BinaryOperationId`] of the binary expression
    #[prost(enumeration = "BinaryOperationId", tag = "6")]
    pub operation: i32,
    /// Left and right operands of the binary expression
    #[prost(message, repeated, tag = "7")]
    pub operands: Vec<Scalar>,
}

/// Predicate
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Predicate {
    /// [`PredicateType`] of the predicate
    #[prost(enumeration = "PredicateType", tag = "1")]
    pub predicate_type: i32,
    /// [`ComparisonId`] of the comparison
    #[prost(enumeration = "ComparisonId", tag = "2")]
    pub comparison: i32,
    /// Left operand of the comparison
    #[prost(message, optional, tag = "3")]
    pub left: Option<Scalar>,
    /// Right operand of the comparison
    #[prost(message, optional, tag = "4")]
    pub right: Option<Scalar>,
    /// Operands of the conjunction, disjunction and negation
    #[prost(message, repeated, tag = "5")]
    pub operands: Vec<Predicate>,
}

/// Aggregate function
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct AggregateFunction {
    /// [`AggregationId`] of the function
    #[prost(enumeration = "AggregationId", tag = "1")]
    pub aggregation_id: i32,
}

/// Aggregate expression
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Aggregate {
    /// The function
    #[prost(message, optional, tag = "1")]
    pub function: Option<AggregateFunction>,
    /// Arguments of the function
    #[prost(message, repeated, tag = "2")]
    pub argument: Vec<Scalar>,
    /// Aggregate the distinct arguments only
    #[prost(bool, tag = "3")]
    pub is_distinct: bool,
}

/// Attach the bloom filter to the attribute
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct BloomFilterAttachment {
    /// Index of the bloom filter
    #[prost(uint32, tag = "1")]
    pub bloom_filter_id: u32,
    /// Attribute tested against the filter
    #[prost(uint32, tag = "2")]
    pub attribute_id: u32,
}

/// Aggregation operator
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AggregationOperationState {
    /// Input relation
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    /// Aggregates
    #[prost(message, repeated, tag = "2")]
    pub aggregates: Vec<Aggregate>,
    /// GROUP BY expressions
    #[prost(message, repeated, tag = "3")]
    pub group_by_expressions: Vec<Scalar>,
    /// Filter of the input tuples
    #[prost(message, optional, tag = "4")]
    pub predicate: Option<Predicate>,
    /// Estimated number of groups
    #[prost(uint64, tag = "5")]
    pub estimated_num_entries: u64,
    /// [`HashTableImplType`] of the group by hash tables, required if there is GROUP BY
    #[prost(enumeration = "HashTableImplType", optional, tag = "6")]
    pub hash_table_impl_type: Option<i32>,
    /// [`HashTableImplType`] of the distinctify hash tables, one for each DISTINCT
    /// aggregate in order
    #[prost(enumeration = "HashTableImplType", repeated, tag = "7")]
    pub distinctify_hash_table_impl_types: Vec<i32>,
    /// Bloom filters applied before aggregation
    #[prost(message, repeated, tag = "8")]
    pub bloom_filters: Vec<BloomFilterAttachment>,
    /// Number of the partitions of the groups, zero and one mean not partitioned
    #[prost(uint64, tag = "9")]
    pub num_partitions: u64,
}
