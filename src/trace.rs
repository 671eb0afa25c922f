/*
 * SPDX-FileCopyrightText: Copyright (c) 2025, NVIDIA CORPORATION. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::{error::Error, fmt::Write};

pub trait ErrorChainExt {
    fn chain(&self) -> impl tracing::Value;
}

impl<T: Error + ?Sized> ErrorChainExt for T {
    fn chain(&self) -> impl tracing::Value {
        let mut err = String::new();
        let mut src = self.source();

        write!(err, "{}", self).ok();
        while let Some(s) = src {
            write!(err, ": {}", s).ok();
            src = s.source();
        }
        err
    }
}
