/*
FaF DNS Latency measures DNS query/response round trip times
Copyright (C) 2022  James Bates

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

// gxhash needs AES intrinsics; fall back to ahash everywhere else

#[cfg(any(
    all(any(target_arch = "arm", target_arch = "aarch64"), target_feature = "aes", target_feature = "neon"),
    all(any(target_arch = "x86", target_arch = "x86_64"), target_feature = "aes", target_feature = "sse2")
))]
pub type KeyBuildHasher = gxhash::GxBuildHasher;

#[cfg(not(any(
    all(any(target_arch = "arm", target_arch = "aarch64"), target_feature = "aes", target_feature = "neon"),
    all(any(target_arch = "x86", target_arch = "x86_64"), target_feature = "aes", target_feature = "sse2")
)))]
pub type KeyBuildHasher = ahash::RandomState;

#[inline]
pub fn key_build_hasher() -> KeyBuildHasher {
    KeyBuildHasher::default()
}
