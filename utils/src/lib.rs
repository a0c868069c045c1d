use rand::distributions::Alphanumeric;
use rand::Rng;

pub fn rand_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn rand_number(n: u32) -> String {
    rand::thread_rng()
        .gen_range(10usize.pow(n - 1)..10usize.pow(n))
        .to_string()
}

pub fn rand_bytes(n: usize) -> Vec<u8> {
    (0..n).map(|_| rand::random::<u8>()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_string_length_and_charset() {
        let s = rand_string(20);
        assert_eq!(20, s.len());
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(s, s.to_lowercase());
    }

    #[test]
    fn rand_number_width() {
        for _ in 0..10 {
            assert_eq!(6, rand_number(6).len());
        }
    }
}
