/// Round up `n` to the nearest `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}
