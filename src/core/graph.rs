//! Lazy expression graph for server-side image computation.
//!
//! Nothing here talks to the network: builders only assemble an immutable
//! tree of function invocations. [`Expression::encode`] turns a tree into
//! the Earth Engine REST `Expression` JSON (a flat table of value nodes
//! referenced by id), which is only evaluated once an export is submitted.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A node of the computation graph
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Constant(Value),
    Invocation {
        function: String,
        arguments: BTreeMap<String, Arc<Node>>,
    },
    /// Single-argument function used by `Collection.map`
    Lambda { parameter: String, body: Arc<Node> },
    Argument(String),
}

impl Node {
    pub fn constant(value: impl Into<Value>) -> Arc<Node> {
        Arc::new(Node::Constant(value.into()))
    }

    pub fn invoke<'a, I>(function: &str, arguments: I) -> Arc<Node>
    where
        I: IntoIterator<Item = (&'a str, Arc<Node>)>,
    {
        Arc::new(Node::Invocation {
            function: function.to_string(),
            arguments: arguments
                .into_iter()
                .map(|(name, node)| (name.to_string(), node))
                .collect(),
        })
    }

    pub fn strings(values: &[&str]) -> Arc<Node> {
        Node::constant(Value::from(values.iter().map(|s| s.to_string()).collect::<Vec<_>>()))
    }
}

/// Geometry handle (an AOI asset or an inline polygon)
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry(pub Arc<Node>);

impl Geometry {
    /// Union geometry of a table asset
    pub fn from_table(asset_id: &str) -> Self {
        let table = Node::invoke(
            "Collection.loadTable",
            [("tableId", Node::constant(asset_id))],
        );
        Geometry(Node::invoke("Collection.geometry", [("collection", table)]))
    }

    pub fn polygon(ring: &[[f64; 2]]) -> Self {
        let coordinates: Vec<Value> = ring.iter().map(|[x, y]| json!([x, y])).collect();
        Geometry(Node::invoke(
            "GeometryConstructors.Polygon",
            [("coordinates", Node::constant(Value::Array(vec![Value::Array(coordinates)])))],
        ))
    }
}

/// Filter handle
#[derive(Debug, Clone, PartialEq)]
pub struct Filter(pub Arc<Node>);

impl Filter {
    pub fn intersects(geometry: &Geometry) -> Self {
        Filter(Node::invoke(
            "Filter.intersects",
            [
                ("leftField", Node::constant(".all")),
                ("rightValue", geometry.0.clone()),
            ],
        ))
    }

    /// Inclusive calendar range on `field` ("year", "month", ...)
    pub fn calendar_range(start: i64, end: i64, field: &str) -> Self {
        Filter(Node::invoke(
            "Filter.calendarRange",
            [
                ("start", Node::constant(start)),
                ("end", Node::constant(end)),
                ("field", Node::constant(field)),
            ],
        ))
    }

    pub fn less_than(property: &str, value: f64) -> Self {
        Filter(Node::invoke(
            "Filter.lessThan",
            [
                ("leftField", Node::constant(property)),
                ("rightValue", Node::constant(value)),
            ],
        ))
    }

    pub fn equals_fields(left: &str, right: &str) -> Self {
        Filter(Node::invoke(
            "Filter.equals",
            [
                ("leftField", Node::constant(left)),
                ("rightField", Node::constant(right)),
            ],
        ))
    }
}

/// Reducer handle
#[derive(Debug, Clone, PartialEq)]
pub struct Reducer(pub Arc<Node>);

impl Reducer {
    pub fn robust_linear_regression(num_x: usize, num_y: usize) -> Self {
        Reducer(Node::invoke(
            "Reducer.robustLinearRegression",
            [
                ("numX", Node::constant(num_x)),
                ("numY", Node::constant(num_y)),
            ],
        ))
    }
}

/// Server-side date
#[derive(Debug, Clone, PartialEq)]
pub struct Date(pub Arc<Node>);

impl Date {
    pub fn parse(value: &str) -> Self {
        Date(Node::invoke("Date", [("value", Node::constant(value))]))
    }

    /// Fractional difference `self - start` in `unit`
    pub fn difference(&self, start: &Date, unit: &str) -> Number {
        Number(Node::invoke(
            "Date.difference",
            [
                ("date", self.0.clone()),
                ("start", start.0.clone()),
                ("unit", Node::constant(unit)),
            ],
        ))
    }
}

/// Server-side number
#[derive(Debug, Clone, PartialEq)]
pub struct Number(pub Arc<Node>);

/// Server-side image
#[derive(Debug, Clone, PartialEq)]
pub struct Image(pub Arc<Node>);

impl Image {
    pub fn constant(value: f64) -> Self {
        Image(Node::invoke("Image.constant", [("value", Node::constant(value))]))
    }

    pub fn from_number(number: &Number) -> Self {
        Image(Node::invoke("Image.constant", [("value", number.0.clone())]))
    }

    fn unary(&self, function: &str, key: &str) -> Self {
        Image(Node::invoke(function, [(key, self.0.clone())]))
    }

    fn binary(&self, function: &str, other: &Image) -> Self {
        Image(Node::invoke(
            function,
            [("image1", self.0.clone()), ("image2", other.0.clone())],
        ))
    }

    pub fn select(&self, bands: &[&str]) -> Self {
        Image(Node::invoke(
            "Image.select",
            [("input", self.0.clone()), ("bandSelectors", Node::strings(bands))],
        ))
    }

    pub fn rename(&self, names: &[&str]) -> Self {
        Image(Node::invoke(
            "Image.rename",
            [("input", self.0.clone()), ("names", Node::strings(names))],
        ))
    }

    pub fn add_bands(&self, other: &Image) -> Self {
        Image(Node::invoke(
            "Image.addBands",
            [("dstImg", self.0.clone()), ("srcImg", other.0.clone())],
        ))
    }

    pub fn update_mask(&self, mask: &Image) -> Self {
        Image(Node::invoke(
            "Image.updateMask",
            [("image", self.0.clone()), ("mask", mask.0.clone())],
        ))
    }

    pub fn mask(&self) -> Self {
        self.unary("Image.mask", "image")
    }

    pub fn clip(&self, geometry: &Geometry) -> Self {
        Image(Node::invoke(
            "Image.clip",
            [("input", self.0.clone()), ("geometry", geometry.0.clone())],
        ))
    }

    pub fn clip_to_bounds_and_scale(&self, geometry: &Geometry, scale: f64) -> Self {
        Image(Node::invoke(
            "Image.clipToBoundsAndScale",
            [
                ("input", self.0.clone()),
                ("geometry", geometry.0.clone()),
                ("scale", Node::constant(scale)),
            ],
        ))
    }

    pub fn add(&self, value: f64) -> Self {
        self.binary("Image.add", &Image::constant(value))
    }

    pub fn multiply(&self, value: f64) -> Self {
        self.binary("Image.multiply", &Image::constant(value))
    }

    pub fn gt(&self, value: f64) -> Self {
        self.binary("Image.gt", &Image::constant(value))
    }

    pub fn not(&self) -> Self {
        self.unary("Image.not", "value")
    }

    pub fn cos(&self) -> Self {
        self.unary("Image.cos", "value")
    }

    pub fn sin(&self) -> Self {
        self.unary("Image.sin", "value")
    }

    pub fn to_float(&self) -> Self {
        self.unary("Image.toFloat", "value")
    }

    pub fn normalized_difference(&self, first: &str, second: &str) -> Self {
        Image(Node::invoke(
            "Image.normalizedDifference",
            [
                ("input", self.0.clone()),
                ("bandNames", Node::strings(&[first, second])),
            ],
        ))
    }

    /// Acquisition date (`system:time_start`)
    pub fn date(&self) -> Date {
        let millis = self.get("system:time_start");
        Date(Node::invoke("Date", [("value", millis)]))
    }

    /// Image stored in a property by a save-first join
    pub fn property_image(&self, property: &str) -> Image {
        Image(self.get(property))
    }

    fn get(&self, property: &str) -> Arc<Node> {
        Node::invoke(
            "Element.get",
            [("object", self.0.clone()), ("property", Node::constant(property))],
        )
    }

    pub fn array_project(&self, axes: &[usize]) -> Self {
        Image(Node::invoke(
            "Image.arrayProject",
            [("input", self.0.clone()), ("axes", Node::constant(axes.to_vec()))],
        ))
    }

    pub fn array_flatten(&self, labels: &[&str]) -> Self {
        let labels = Value::Array(vec![Value::from(
            labels.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )]);
        Image(Node::invoke(
            "Image.arrayFlatten",
            [("image", self.0.clone()), ("coordinateLabels", Node::constant(labels))],
        ))
    }
}

/// Server-side image collection
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCollection(pub Arc<Node>);

impl ImageCollection {
    pub fn load(id: &str) -> Self {
        ImageCollection(Node::invoke("ImageCollection.load", [("id", Node::constant(id))]))
    }

    pub fn filter(&self, filter: &Filter) -> Self {
        ImageCollection(Node::invoke(
            "Collection.filter",
            [("collection", self.0.clone()), ("filter", filter.0.clone())],
        ))
    }

    pub fn filter_bounds(&self, geometry: &Geometry) -> Self {
        self.filter(&Filter::intersects(geometry))
    }

    /// Map a per-image function over the collection
    pub fn map<F>(&self, f: F) -> Self
    where
        F: FnOnce(&Image) -> Image,
    {
        let parameter = "_MAPPING_VAR_0_0".to_string();
        let body = f(&Image(Arc::new(Node::Argument(parameter.clone()))));
        ImageCollection(Node::invoke(
            "Collection.map",
            [
                ("collection", self.0.clone()),
                ("baseAlgorithm", Arc::new(Node::Lambda { parameter, body: body.0 })),
            ],
        ))
    }

    pub fn select(&self, bands: &[&str]) -> Self {
        let bands: Vec<String> = bands.iter().map(|s| s.to_string()).collect();
        self.map(move |image| {
            let refs: Vec<&str> = bands.iter().map(String::as_str).collect();
            image.select(&refs)
        })
    }

    /// Save-first join on `system:index`; the match is stored in `property`
    pub fn save_first_join(&self, secondary: &ImageCollection, property: &str) -> Self {
        let join = Node::invoke("Join.saveFirst", [("matchKey", Node::constant(property))]);
        let condition = Filter::equals_fields("system:index", "system:index");
        ImageCollection(Node::invoke(
            "Join.apply",
            [
                ("join", join),
                ("primary", self.0.clone()),
                ("secondary", secondary.0.clone()),
                ("condition", condition.0),
            ],
        ))
    }

    pub fn reduce(&self, reducer: &Reducer) -> Image {
        Image(Node::invoke(
            "ImageCollection.reduce",
            [("collection", self.0.clone()), ("reducer", reducer.0.clone())],
        ))
    }
}

/// Serialized form of a graph, ready for a REST request body
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub result: String,
    pub values: Map<String, Value>,
}

impl Expression {
    /// Flatten a graph into the REST value table.
    ///
    /// Invocations are interned by structure, so subtrees that occur more
    /// than once (the AOI geometry, shared filters) are emitted a single time.
    pub fn encode(root: &Arc<Node>) -> Self {
        let mut encoder = Encoder::default();
        let top = encoder.value_node(root);
        let result = match top {
            ValueRef::Reference(id) => id,
            ValueRef::Inline(value) => encoder.intern(value),
        };
        Expression {
            result,
            values: encoder.values.into_iter().collect(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "result": self.result, "values": self.values })
    }
}

enum ValueRef {
    Reference(String),
    Inline(Value),
}

impl ValueRef {
    fn into_value(self) -> Value {
        match self {
            ValueRef::Reference(id) => json!({ "valueReference": id }),
            ValueRef::Inline(value) => value,
        }
    }
}

#[derive(Default)]
struct Encoder {
    values: BTreeMap<String, Value>,
    seen: HashMap<String, String>,
}

impl Encoder {
    fn intern(&mut self, value: Value) -> String {
        let key = value.to_string();
        if let Some(id) = self.seen.get(&key) {
            return id.clone();
        }
        let id = self.values.len().to_string();
        self.values.insert(id.clone(), value);
        self.seen.insert(key, id.clone());
        id
    }

    fn value_node(&mut self, node: &Arc<Node>) -> ValueRef {
        match node.as_ref() {
            Node::Constant(value) => ValueRef::Inline(json!({ "constantValue": value })),
            Node::Argument(name) => ValueRef::Inline(json!({ "argumentReference": name })),
            Node::Lambda { parameter, body } => {
                let body_id = match self.value_node(body) {
                    ValueRef::Reference(id) => id,
                    ValueRef::Inline(value) => self.intern(value),
                };
                ValueRef::Inline(json!({
                    "functionDefinitionValue": {
                        "argumentNames": [parameter],
                        "body": body_id,
                    }
                }))
            }
            Node::Invocation { function, arguments } => {
                let mut args = Map::new();
                for (name, argument) in arguments {
                    args.insert(name.clone(), self.value_node(argument).into_value());
                }
                let value = json!({
                    "functionInvocationValue": {
                        "functionName": function,
                        "arguments": args,
                    }
                });
                ValueRef::Reference(self.intern(value))
            }
        }
    }
}
