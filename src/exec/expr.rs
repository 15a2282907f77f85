// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Vectorized scalar expressions over pages.
//!
//! Expressions are a closed sum type evaluated column-at-a-time with Arrow compute kernels.
//! Int64 operands are widened to Float64 when mixed with Float64 operands.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::kernels::numeric::{add, mul, rem, sub};
use arrow::compute::{and_kleene, cast, is_null, not, or_kleene};
use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};

use crate::common::status::{ExecError, Result};
use crate::exec::page::{ColumnType, Page, Value};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Modulo,
}

impl BinaryOp {
    fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(usize),
    Literal {
        value: Value,
        column_type: ColumnType,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

impl Expr {
    pub fn col(channel: usize) -> Self {
        Expr::Column(channel)
    }

    pub fn lit(value: Value) -> Result<Self> {
        let column_type = value
            .column_type()
            .ok_or_else(|| ExecError::invalid_plan("untyped NULL literal"))?;
        Ok(Expr::Literal { value, column_type })
    }

    pub fn long(value: i64) -> Self {
        Expr::Literal {
            value: Value::Int64(value),
            column_type: ColumnType::Int64,
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn data_type(&self, input: &[ColumnType]) -> Result<ColumnType> {
        match self {
            Expr::Column(channel) => input.get(*channel).copied().ok_or_else(|| {
                ExecError::invalid_plan(format!(
                    "column {} out of range for {} input channels",
                    channel,
                    input.len()
                ))
            }),
            Expr::Literal { column_type, .. } => Ok(*column_type),
            Expr::Binary { op, left, right } => {
                let l = left.data_type(input)?;
                let r = right.data_type(input)?;
                if op.is_logical() {
                    if l != ColumnType::Boolean || r != ColumnType::Boolean {
                        return Err(ExecError::invalid_plan(format!(
                            "{:?} requires boolean operands, got {:?} and {:?}",
                            op, l, r
                        )));
                    }
                    return Ok(ColumnType::Boolean);
                }
                let common = common_type(l, r)?;
                if op.is_comparison() {
                    return Ok(ColumnType::Boolean);
                }
                if !common.is_numeric() {
                    return Err(ExecError::invalid_plan(format!(
                        "{:?} requires numeric operands, got {:?}",
                        op, common
                    )));
                }
                Ok(common)
            }
            Expr::Not(inner) => {
                let t = inner.data_type(input)?;
                if t != ColumnType::Boolean {
                    return Err(ExecError::invalid_plan(format!(
                        "NOT requires a boolean operand, got {:?}",
                        t
                    )));
                }
                Ok(ColumnType::Boolean)
            }
            Expr::IsNull(inner) => {
                inner.data_type(input)?;
                Ok(ColumnType::Boolean)
            }
        }
    }

    pub fn eval(&self, page: &Page) -> Result<ArrayRef> {
        match self {
            Expr::Column(channel) => Ok(Arc::clone(page.block(*channel)?.array())),
            Expr::Literal { value, column_type } => {
                value.to_array(*column_type, page.position_count())
            }
            Expr::Binary { op, left, right } => {
                let l = left.eval(page)?;
                let r = right.eval(page)?;
                eval_binary(*op, l, r)
            }
            Expr::Not(inner) => {
                let v = inner.eval(page)?;
                Ok(Arc::new(not(as_boolean(&v)?)?))
            }
            Expr::IsNull(inner) => {
                let v = inner.eval(page)?;
                Ok(Arc::new(is_null(v.as_ref())?))
            }
        }
    }

    /// Evaluate as a filter mask.
    pub fn eval_predicate(&self, page: &Page) -> Result<BooleanArray> {
        let v = self.eval(page)?;
        Ok(as_boolean(&v)?.clone())
    }
}

fn common_type(l: ColumnType, r: ColumnType) -> Result<ColumnType> {
    match (l, r) {
        (a, b) if a == b => Ok(a),
        (ColumnType::Int64, ColumnType::Float64) | (ColumnType::Float64, ColumnType::Int64) => {
            Ok(ColumnType::Float64)
        }
        (a, b) => Err(ExecError::invalid_plan(format!(
            "incompatible operand types {:?} and {:?}",
            a, b
        ))),
    }
}

fn as_boolean(array: &ArrayRef) -> Result<&BooleanArray> {
    array.as_boolean_opt().ok_or_else(|| {
        ExecError::internal(format!(
            "expected boolean array, got {:?}",
            array.data_type()
        ))
    })
}

fn widen(array: ArrayRef, target: &DataType) -> Result<ArrayRef> {
    if array.data_type() == target {
        return Ok(array);
    }
    Ok(cast(array.as_ref(), target)?)
}

fn eval_binary(op: BinaryOp, l: ArrayRef, r: ArrayRef) -> Result<ArrayRef> {
    if op.is_logical() {
        let out = match op {
            BinaryOp::And => and_kleene(as_boolean(&l)?, as_boolean(&r)?)?,
            _ => or_kleene(as_boolean(&l)?, as_boolean(&r)?)?,
        };
        return Ok(Arc::new(out));
    }
    let lt_ = ColumnType::from_arrow(l.data_type())?;
    let rt_ = ColumnType::from_arrow(r.data_type())?;
    let target = common_type(lt_, rt_)?.to_arrow();
    let l = widen(l, &target)?;
    let r = widen(r, &target)?;
    let out: ArrayRef = match op {
        BinaryOp::Eq => Arc::new(eq(&l, &r)?),
        BinaryOp::NotEq => Arc::new(neq(&l, &r)?),
        BinaryOp::Lt => Arc::new(lt(&l, &r)?),
        BinaryOp::LtEq => Arc::new(lt_eq(&l, &r)?),
        BinaryOp::Gt => Arc::new(gt(&l, &r)?),
        BinaryOp::GtEq => Arc::new(gt_eq(&l, &r)?),
        BinaryOp::Plus => add(&l, &r)?,
        BinaryOp::Minus => sub(&l, &r)?,
        BinaryOp::Multiply => mul(&l, &r)?,
        BinaryOp::Modulo => rem(&l, &r)?,
        BinaryOp::And | BinaryOp::Or => {
            return Err(ExecError::internal("logical operator reached arithmetic path"));
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::page::Block;

    fn page() -> Page {
        Page::try_new(vec![
            Block::from_longs(vec![1, 2, 3, 4, 5, 6]),
            Block::from_doubles(vec![0.5, 1.5, 2.5, 3.5, 4.5, 5.5]),
        ])
        .unwrap()
    }

    #[test]
    fn comparison_and_modulo_filter() {
        // x % 2 = 0 AND x > 2
        let predicate = Expr::binary(
            BinaryOp::And,
            Expr::binary(
                BinaryOp::Eq,
                Expr::binary(BinaryOp::Modulo, Expr::col(0), Expr::long(2)),
                Expr::long(0),
            ),
            Expr::binary(BinaryOp::Gt, Expr::col(0), Expr::long(2)),
        );
        assert_eq!(
            predicate
                .data_type(&[ColumnType::Int64, ColumnType::Float64])
                .unwrap(),
            ColumnType::Boolean
        );
        let mask = predicate.eval_predicate(&page()).unwrap();
        let filtered = page().filter(&mask).unwrap();
        let values: Vec<i64> = (0..filtered.position_count())
            .map(|i| filtered.block(0).unwrap().get_long(i).unwrap())
            .collect();
        assert_eq!(values, vec![4, 6]);
    }

    #[test]
    fn mixed_arithmetic_widens_to_double() {
        let expr = Expr::binary(BinaryOp::Plus, Expr::col(0), Expr::col(1));
        assert_eq!(
            expr.data_type(&[ColumnType::Int64, ColumnType::Float64]).unwrap(),
            ColumnType::Float64
        );
        let out = expr.eval(&page()).unwrap();
        let block = Block::try_new(out).unwrap();
        assert_eq!(block.get_double(0).unwrap(), 1.5);
    }

    #[test]
    fn type_errors_are_invalid_plan() {
        let expr = Expr::binary(BinaryOp::And, Expr::col(0), Expr::long(1));
        assert!(expr.data_type(&[ColumnType::Int64]).is_err());
        assert!(Expr::col(3).data_type(&[ColumnType::Int64]).is_err());
    }
}
