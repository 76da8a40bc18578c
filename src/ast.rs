//! Conversion of parsed FHIRPath expressions into the debug-tree format the
//! fhirpath-lab UI renders.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// AST node in the shape the lab UI expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstNode {
    #[serde(rename = "ExpressionType")]
    pub expression_type: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Arguments", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<AstNode>>,

    #[serde(rename = "ReturnType", skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,

    #[serde(rename = "Position", skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,

    #[serde(rename = "Length", skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

pub fn extract_resource_type(resource: &JsonValue) -> Option<String> {
    resource
        .get("resourceType")
        .and_then(|rt| rt.as_str())
        .map(|s| s.to_string())
}

/// Convert the parser AST into the lab debug-tree format.
///
/// Return types are filled in where they follow directly from the node
/// (literals, comparisons, boolean operators); everything else is left for
/// the semantic analysis result to report.
pub fn convert_ast_to_lab_format(ast: &octofhir_fhirpath::ast::ExpressionNode) -> AstNode {
    use octofhir_fhirpath::ast::*;

    match ast {
        ExpressionNode::Identifier(node) => AstNode {
            expression_type: "AxisExpression".to_string(),
            name: "builtin.that".to_string(),
            arguments: None,
            return_type: None,
            position: node.location.as_ref().map(|l| l.offset),
            length: node.location.as_ref().map(|l| l.length),
        },

        ExpressionNode::PropertyAccess(node) => {
            let object_arg = convert_ast_to_lab_format(&node.object);

            AstNode {
                expression_type: "ChildExpression".to_string(),
                name: node.property.clone(),
                arguments: Some(vec![object_arg]),
                return_type: None,
                position: node.location.as_ref().map(|l| l.offset),
                length: node.location.as_ref().map(|l| l.length),
            }
        }

        ExpressionNode::FunctionCall(node) => {
            let args: Vec<AstNode> = node.arguments.iter().map(convert_ast_to_lab_format).collect();

            AstNode {
                expression_type: "FunctionCallExpression".to_string(),
                name: node.name.clone(),
                arguments: if args.is_empty() { None } else { Some(args) },
                return_type: None,
                position: node.location.as_ref().map(|l| l.offset),
                length: node.location.as_ref().map(|l| l.length),
            }
        }

        ExpressionNode::MethodCall(node) => {
            // The receiver travels as the first argument in the lab format.
            let mut args = vec![convert_ast_to_lab_format(&node.object)];
            args.extend(node.arguments.iter().map(convert_ast_to_lab_format));

            AstNode {
                expression_type: "FunctionCallExpression".to_string(),
                name: node.method.clone(),
                arguments: Some(args),
                return_type: None,
                position: node.location.as_ref().map(|l| l.offset),
                length: node.location.as_ref().map(|l| l.length),
            }
        }

        ExpressionNode::Literal(node) => {
            let (name, return_type) = match &node.value {
                LiteralValue::String(s) => (format!("\"{s}\""), "string"),
                LiteralValue::Integer(i) => (i.to_string(), "integer"),
                LiteralValue::Long(i) => (format!("{i}L"), "long"),
                LiteralValue::Decimal(d) => (d.to_string(), "decimal"),
                LiteralValue::Boolean(b) => (b.to_string(), "boolean"),
                LiteralValue::Date(d) => (format!("@{d}"), "date"),
                LiteralValue::DateTime(dt) => (format!("@{dt}"), "dateTime"),
                LiteralValue::Time(t) => (format!("@{t}"), "time"),
                LiteralValue::Quantity { value, unit } => {
                    let unit_str = unit.as_deref().unwrap_or("");
                    (format!("{value} '{unit_str}'"), "Quantity")
                }
            };

            AstNode {
                expression_type: "ConstantExpression".to_string(),
                name,
                arguments: None,
                return_type: Some(return_type.to_string()),
                position: node.location.as_ref().map(|l| l.offset),
                length: node.location.as_ref().map(|l| l.length),
            }
        }

        ExpressionNode::BinaryOperation(node) => {
            let left_arg = convert_ast_to_lab_format(&node.left);
            let right_arg = convert_ast_to_lab_format(&node.right);

            AstNode {
                expression_type: "BinaryExpression".to_string(),
                name: format!("{:?}", node.operator).to_lowercase(),
                arguments: Some(vec![left_arg, right_arg]),
                return_type: binary_return_type(&node.operator),
                position: node.location.as_ref().map(|l| l.offset),
                length: node.location.as_ref().map(|l| l.length),
            }
        }

        ExpressionNode::Variable(node) => AstNode {
            expression_type: "VariableRefExpression".to_string(),
            name: format!("%{}", node.name),
            arguments: None,
            return_type: None,
            position: node.location.as_ref().map(|l| l.offset),
            length: node.location.as_ref().map(|l| l.length),
        },

        ExpressionNode::IndexAccess(node) => {
            let object_arg = convert_ast_to_lab_format(&node.object);
            let index_arg = convert_ast_to_lab_format(&node.index);

            AstNode {
                expression_type: "IndexerExpression".to_string(),
                name: "[]".to_string(),
                arguments: Some(vec![object_arg, index_arg]),
                return_type: None,
                position: node.location.as_ref().map(|l| l.offset),
                length: node.location.as_ref().map(|l| l.length),
            }
        }

        ExpressionNode::UnaryOperation(node) => {
            let operand_arg = convert_ast_to_lab_format(&node.operand);

            let (op_name, return_type) = match node.operator {
                octofhir_fhirpath::ast::UnaryOperator::Not => ("not", Some("boolean".to_string())),
                octofhir_fhirpath::ast::UnaryOperator::Negate => ("-", None),
                octofhir_fhirpath::ast::UnaryOperator::Positive => ("+", None),
            };

            AstNode {
                expression_type: "UnaryExpression".to_string(),
                name: op_name.to_string(),
                arguments: Some(vec![operand_arg]),
                return_type,
                position: node.location.as_ref().map(|l| l.offset),
                length: node.location.as_ref().map(|l| l.length),
            }
        }

        ExpressionNode::Collection(node) => {
            let args: Vec<AstNode> = node.elements.iter().map(convert_ast_to_lab_format).collect();

            AstNode {
                expression_type: "CollectionExpression".to_string(),
                name: "{}".to_string(),
                arguments: if args.is_empty() { None } else { Some(args) },
                return_type: None,
                position: node.location.as_ref().map(|l| l.offset),
                length: node.location.as_ref().map(|l| l.length),
            }
        }

        ExpressionNode::Parenthesized(expr) => convert_ast_to_lab_format(expr),

        _ => {
            let expression_type = match ast {
                ExpressionNode::TypeCast(_) => "TypeCastExpression",
                ExpressionNode::Filter(_) => "FilterExpression",
                ExpressionNode::Union(_) => "UnionExpression",
                ExpressionNode::TypeCheck(_) => "TypeCheckExpression",
                ExpressionNode::Path(_) => "PathExpression",
                ExpressionNode::Lambda(_) => "LambdaExpression",
                _ => "UnsupportedExpression",
            };

            AstNode {
                expression_type: expression_type.to_string(),
                name: "unsupported".to_string(),
                arguments: None,
                return_type: None,
                position: None,
                length: None,
            }
        }
    }
}

fn binary_return_type(operator: &octofhir_fhirpath::ast::BinaryOperator) -> Option<String> {
    use octofhir_fhirpath::ast::BinaryOperator;

    match operator {
        BinaryOperator::Equal
        | BinaryOperator::NotEqual
        | BinaryOperator::GreaterThan
        | BinaryOperator::LessThan
        | BinaryOperator::GreaterThanOrEqual
        | BinaryOperator::LessThanOrEqual
        | BinaryOperator::And
        | BinaryOperator::Or
        | BinaryOperator::Xor => Some("boolean".to_string()),
        BinaryOperator::Concatenate => Some("string".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_type_extraction() {
        assert_eq!(
            extract_resource_type(&json!({ "resourceType": "Patient" })),
            Some("Patient".to_string())
        );
        assert_eq!(extract_resource_type(&json!({ "id": "x" })), None);
        assert_eq!(extract_resource_type(&json!(42)), None);
    }

    #[test]
    fn ast_node_serializes_with_lab_field_names() {
        let node = AstNode {
            expression_type: "ChildExpression".to_string(),
            name: "name".to_string(),
            arguments: None,
            return_type: Some("HumanName[]".to_string()),
            position: Some(8),
            length: Some(4),
        };

        let value = serde_json::to_value(&node).expect("serialize");
        assert_eq!(value["ExpressionType"], "ChildExpression");
        assert_eq!(value["Name"], "name");
        assert_eq!(value["ReturnType"], "HumanName[]");
        assert_eq!(value["Position"], 8);
        assert_eq!(value["Length"], 4);
        assert!(value.get("Arguments").is_none());
    }
}
